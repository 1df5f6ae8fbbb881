//! Adapters for the external analysis backend: directory listing, file
//! reads, channel initialization and per-frame pixel fetches.

use crate::error::{CurationError, CurationResult};
use serde::{Serialize, de::DeserializeOwned};
use std::{path::Path, sync::Arc, time::Duration};
use trace_curator_protocol::{
    ChannelDescriptor, DataType, DirectoryItem, DirectoryListing, FrameRequest, FrameResponse,
    LIST_DIRECTORY_ENDPOINT, ListDirectoryRequest, READ_FILE_ENDPOINT, ReadFileRequest,
    ReadFileResponse, VISUALIZATION_FRAME_ENDPOINT, VISUALIZATION_INIT_ENDPOINT,
    VisualizationInitRequest, VisualizationInitResponse,
};

/// Opaque token the backend hands out per channel; frames are requested
/// through it without re-resolving the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMeta {
    pub channel_id: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub n_frames: usize,
    pub intensity_min: f64,
    pub intensity_max: f64,
    pub source_handle: SourceHandle,
}

impl ChannelMeta {
    pub fn from_descriptor(d: ChannelDescriptor) -> CurationResult<Self> {
        if !(2..=3).contains(&d.shape.len()) {
            return Err(CurationError::backend(format!(
                "channel '{}' has a {}-dimensional shape, expected 2 or 3",
                d.channel,
                d.shape.len()
            )));
        }
        if d.n_frames == 0 {
            return Err(CurationError::backend(format!(
                "channel '{}' has no frames",
                d.channel
            )));
        }
        if !d.vmin.is_finite() || !d.vmax.is_finite() {
            return Err(CurationError::backend(format!(
                "channel '{}' has a non-finite intensity range",
                d.channel
            )));
        }
        Ok(Self {
            channel_id: d.channel,
            dtype: d.dtype,
            shape: d.shape,
            n_frames: d.n_frames,
            intensity_min: d.vmin,
            intensity_max: d.vmax,
            source_handle: SourceHandle(d.path),
        })
    }

    /// `(height, width)` of one frame.
    pub fn frame_dims(&self) -> (usize, usize) {
        let n = self.shape.len();
        (self.shape[n - 2], self.shape[n - 1])
    }

    pub fn check_frame(&self, frame_index: usize) -> CurationResult<()> {
        if frame_index >= self.n_frames {
            return Err(CurationError::range(format!(
                "frame {frame_index} out of range for channel '{}' ({} frames)",
                self.channel_id, self.n_frames
            )));
        }
        Ok(())
    }
}

/// One frame of samples, row-major, `height * width` long.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSlice {
    pub width: usize,
    pub height: usize,
    pub samples: Vec<f32>,
}

impl FrameSlice {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> CurationResult<Self> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if height == 0 || width == 0 {
            return Err(CurationError::backend("frame payload is empty"));
        }
        let mut samples = Vec::with_capacity(width * height);
        for (y, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(CurationError::backend(format!(
                    "frame row {y} has {} samples, expected {width}",
                    row.len()
                )));
            }
            samples.extend(row.into_iter().map(|v| v as f32));
        }
        Ok(Self {
            width,
            height,
            samples,
        })
    }

    pub fn sample(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples.get(y * self.width + x).copied()
    }
}

/// Result of a visualization init.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInit {
    pub fov_id: u32,
    pub channels: Vec<ChannelMeta>,
    pub traces_csv: Option<String>,
}

pub trait DirectoryService: Send + Sync {
    fn list(&self, path: &str) -> CurationResult<Vec<DirectoryItem>>;
    fn read_text(&self, path: &str) -> CurationResult<String>;
}

pub trait FrameSource: Send + Sync {
    fn init_channels(
        &self,
        output_dir: &str,
        fov_id: u32,
        channel_ids: &[String],
        force_rebuild: bool,
    ) -> CurationResult<ChannelInit>;

    fn get_frame(&self, meta: &ChannelMeta, frame_index: usize) -> CurationResult<FrameSlice>;
}

/// Everything the session needs from the outside world.
pub trait Backend: DirectoryService + FrameSource {}

impl<T: DirectoryService + FrameSource> Backend for T {}

pub type SharedBackend = Arc<dyn Backend>;

fn backend_failure(what: &str, error: Option<String>) -> CurationError {
    let message = error.unwrap_or_else(|| "no error message".to_string());
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("does not exist") {
        CurationError::not_found(format!("{what}: {message}"))
    } else {
        CurationError::backend(format!("{what}: {message}"))
    }
}

/// JSON-over-HTTP client for the analysis backend.
pub struct HttpBackend {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> CurationResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CurationError::backend(format!("could not build backend client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Req,
    ) -> CurationResult<Resp> {
        let url = format!("{}{endpoint}", self.base_url);
        let response = self.client.post(&url).json(body).send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(CurationError::backend(format!(
                "{url} answered {status}: {}",
                text.trim()
            )));
        }
        serde_json::from_str(&text).map_err(|e| {
            CurationError::backend(format!("{url} returned invalid JSON: {e}"))
        })
    }
}

impl DirectoryService for HttpBackend {
    fn list(&self, path: &str) -> CurationResult<Vec<DirectoryItem>> {
        let listing: DirectoryListing = self.post(
            LIST_DIRECTORY_ENDPOINT,
            &ListDirectoryRequest {
                path: path.to_string(),
            },
        )?;
        if !listing.success {
            return Err(backend_failure(&format!("listing '{path}'"), listing.error));
        }
        Ok(listing.items)
    }

    fn read_text(&self, path: &str) -> CurationResult<String> {
        let resp: ReadFileResponse = self.post(
            READ_FILE_ENDPOINT,
            &ReadFileRequest {
                path: path.to_string(),
            },
        )?;
        match (resp.success, resp.content) {
            (true, Some(content)) => Ok(content),
            (true, None) => Err(CurationError::backend(format!("reading '{path}': empty response"))),
            (false, _) => Err(backend_failure(&format!("reading '{path}'"), resp.error)),
        }
    }
}

impl FrameSource for HttpBackend {
    fn init_channels(
        &self,
        output_dir: &str,
        fov_id: u32,
        channel_ids: &[String],
        force_rebuild: bool,
    ) -> CurationResult<ChannelInit> {
        let request = VisualizationInitRequest {
            output_dir: output_dir.to_string(),
            fov_id,
            channels: channel_ids.to_vec(),
            data_types: channel_ids.iter().map(|c| DataType::for_channel(c)).collect(),
            force_rebuild,
        };
        let resp: VisualizationInitResponse = self.post(VISUALIZATION_INIT_ENDPOINT, &request)?;
        channel_init_from_response(resp, fov_id, channel_ids)
    }

    fn get_frame(&self, meta: &ChannelMeta, frame_index: usize) -> CurationResult<FrameSlice> {
        meta.check_frame(frame_index)?;
        let resp: FrameResponse = self.post(
            VISUALIZATION_FRAME_ENDPOINT,
            &FrameRequest::single(&meta.source_handle.0, &meta.channel_id, frame_index),
        )?;
        frame_from_response(resp, meta, frame_index)
    }
}

/// Maps an init answer onto the channels the caller asked for.
pub fn channel_init_from_response(
    resp: VisualizationInitResponse,
    fov_id: u32,
    channel_ids: &[String],
) -> CurationResult<ChannelInit> {
    if !resp.success {
        return Err(backend_failure(&format!("initializing FOV {fov_id}"), resp.error));
    }
    let channels = resp
        .channels
        .into_iter()
        .map(ChannelMeta::from_descriptor)
        .collect::<CurationResult<Vec<_>>>()?;
    for requested in channel_ids {
        if !channels.iter().any(|c| &c.channel_id == requested) {
            return Err(CurationError::not_found(format!(
                "channel '{requested}' not available for FOV {fov_id}"
            )));
        }
    }
    Ok(ChannelInit {
        fov_id: resp.fov_id.unwrap_or(fov_id),
        channels,
        traces_csv: resp.traces_csv,
    })
}

pub fn frame_from_response(
    resp: FrameResponse,
    meta: &ChannelMeta,
    frame_index: usize,
) -> CurationResult<FrameSlice> {
    if !resp.success {
        return Err(backend_failure(
            &format!("frame {frame_index} of '{}'", meta.channel_id),
            resp.error,
        ));
    }
    let rows = resp.frames.into_iter().next().ok_or_else(|| {
        CurationError::backend(format!(
            "frame {frame_index} of '{}': response carried no frames",
            meta.channel_id
        ))
    })?;
    FrameSlice::from_rows(rows)
}

/// Serves listings and file reads straight from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDirectoryService;

impl DirectoryService for LocalDirectoryService {
    fn list(&self, path: &str) -> CurationResult<Vec<DirectoryItem>> {
        let dir = Path::new(path);
        if !dir.is_dir() {
            return Err(CurationError::not_found(format!("directory '{path}' does not exist")));
        }
        let mut items = vec![];
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            items.push(DirectoryItem {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.path().to_string_lossy().to_string(),
                is_directory: entry.file_type()?.is_dir(),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn read_text(&self, path: &str) -> CurationResult<String> {
        std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CurationError::not_found(format!("file '{path}' does not exist"))
            } else {
                e.into()
            }
        })
    }
}
