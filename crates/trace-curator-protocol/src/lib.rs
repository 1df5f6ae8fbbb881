//! Wire contracts between the curation engine and the analysis backend.
//!
//! Every endpoint answers with a `success` flag and an optional `error`
//! string; payload fields are only meaningful when `success` is true.

use serde::{Deserialize, Serialize};

pub const LIST_DIRECTORY_ENDPOINT: &str = "/api/filesystem/list";
pub const READ_FILE_ENDPOINT: &str = "/api/filesystem/read";
pub const VISUALIZATION_INIT_ENDPOINT: &str = "/api/visualization/init";
pub const VISUALIZATION_FRAME_ENDPOINT: &str = "/api/visualization/frame";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirectoryRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryItem {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub success: bool,
    #[serde(default)]
    pub items: Vec<DirectoryItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadFileResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Image,
    Seg,
}

impl DataType {
    /// Segmentation channels are label images; everything else is intensity.
    pub fn for_channel(channel: &str) -> Self {
        if channel.eq_ignore_ascii_case("seg") {
            Self::Seg
        } else {
            Self::Image
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationInitRequest {
    pub output_dir: String,
    pub fov_id: u32,
    pub channels: Vec<String>,
    pub data_types: Vec<DataType>,
    #[serde(default)]
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub n_frames: usize,
    pub vmin: f64,
    pub vmax: f64,
    /// Backend-side cache file used to request frames of this channel.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualizationInitResponse {
    pub success: bool,
    #[serde(default)]
    pub fov_id: Option<u32>,
    #[serde(default)]
    pub channels: Vec<ChannelDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRequest {
    pub cached_path: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_end: Option<usize>,
}

impl FrameRequest {
    pub fn single(cached_path: &str, channel: &str, frame: usize) -> Self {
        Self {
            cached_path: cached_path.to_string(),
            channel: channel.to_string(),
            frame: Some(frame),
            frame_start: None,
            frame_end: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameResponse {
    pub success: bool,
    #[serde(default)]
    pub channel: String,
    /// One row-major 2D array per requested frame.
    #[serde(default)]
    pub frames: Vec<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
