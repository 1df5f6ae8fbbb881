//! Project discovery: FOV folders under an analysis output directory and
//! the channel and trace files each of them holds.

use crate::backend::DirectoryService;
use crate::error::{CurationError, CurationResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use trace_curator_protocol::DirectoryItem;

lazy_static! {
    static ref FOV_DIR: Regex = Regex::new(r"(?i)^fov_(\d+)$").unwrap();
    static ref PHASE_FILE: Regex = Regex::new(r"(?i)_pc(_ch_\d+)?\.npy$").unwrap();
    static ref SEG_FILE: Regex = Regex::new(r"(?i)_seg(_labeled)?(_ch_\d+)?\.npy$").unwrap();
    static ref FL_FILE: Regex = Regex::new(r"(?i)_fl\w*?_ch_(\d+)\.npy$").unwrap();
    static ref TRACES_FILE: Regex = Regex::new(r"(?i)_traces(_inspected)?\.csv$").unwrap();
}

pub const PHASE_CHANNEL: &str = "pc";
pub const SEG_CHANNEL: &str = "seg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FovEntry {
    pub fov_id: u32,
    pub path: String,
    /// `pc`, `seg`, then `fl_<n>` in ascending channel order.
    pub channels: Vec<String>,
    pub traces_csv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub output_dir: String,
    fovs: BTreeMap<u32, FovEntry>,
}

impl Project {
    /// Lists `output_dir`, then each FOV folder in it. A FOV folder that
    /// cannot be listed is skipped with a warning; discovery fails only when
    /// no FOV folder could be read.
    pub fn discover<S: DirectoryService + ?Sized>(
        service: &S,
        output_dir: &str,
    ) -> CurationResult<Self> {
        let mut fovs = BTreeMap::new();
        let mut unreadable: Vec<CurationError> = vec![];
        for item in service.list(output_dir)? {
            if !item.is_directory {
                continue;
            }
            let Some(fov_id) = parse_fov_dir(&item.name) else {
                continue;
            };
            let contents = match service.list(&item.path) {
                Ok(contents) => contents,
                Err(e) => {
                    log::warn!("Skipping FOV folder '{}': {e}", item.path);
                    unreadable.push(e);
                    continue;
                }
            };
            let entry = classify_fov_contents(fov_id, &item.path, &contents);
            if let Some(previous) = fovs.insert(fov_id, entry) {
                log::warn!(
                    "FOV {fov_id} found twice, keeping '{}' over '{}'",
                    item.path,
                    previous.path
                );
            }
        }
        if fovs.is_empty() {
            if let Some(first) = unreadable.into_iter().next() {
                return Err(CurationError::new(
                    first.code,
                    format!(
                        "no FOV folder in '{output_dir}' could be read: {}",
                        first.message
                    ),
                ));
            }
            return Err(CurationError::not_found(format!(
                "no FOV folders (fov_<n>) found in '{output_dir}'"
            )));
        }
        log::info!("Discovered {} FOV(s) in {output_dir}", fovs.len());
        Ok(Self {
            output_dir: output_dir.to_string(),
            fovs,
        })
    }

    pub fn fov_ids(&self) -> Vec<u32> {
        self.fovs.keys().copied().collect()
    }

    pub fn fov(&self, fov_id: u32) -> CurationResult<&FovEntry> {
        self.fovs
            .get(&fov_id)
            .ok_or_else(|| CurationError::not_found(format!("FOV {fov_id} not in project")))
    }

    pub fn check_channels(&self, fov_id: u32, channels: &[String]) -> CurationResult<()> {
        let fov = self.fov(fov_id)?;
        if channels.is_empty() {
            return Err(CurationError::not_found(format!(
                "no channel selected for FOV {fov_id}"
            )));
        }
        for channel in channels {
            if !fov.channels.contains(channel) {
                return Err(CurationError::not_found(format!(
                    "channel '{channel}' not available for FOV {fov_id}"
                )));
            }
        }
        Ok(())
    }
}

pub fn parse_fov_dir(name: &str) -> Option<u32> {
    FOV_DIR.captures(name)?.get(1)?.as_str().parse().ok()
}

fn classify_fov_contents(fov_id: u32, path: &str, items: &[DirectoryItem]) -> FovEntry {
    let mut has_phase = false;
    let mut has_seg = false;
    let mut fluorescence = std::collections::BTreeSet::new();
    let mut raw_traces = None;
    let mut inspected_traces = None;
    for item in items.iter().filter(|i| !i.is_directory) {
        let name = item.name.as_str();
        if let Some(caps) = TRACES_FILE.captures(name) {
            if caps.get(1).is_some() {
                inspected_traces = Some(item.path.clone());
            } else {
                raw_traces = Some(item.path.clone());
            }
        } else if SEG_FILE.is_match(name) {
            has_seg = true;
        } else if PHASE_FILE.is_match(name) {
            has_phase = true;
        } else if let Some(n) = FL_FILE
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            fluorescence.insert(n);
        }
    }
    let mut channels = vec![];
    if has_phase {
        channels.push(PHASE_CHANNEL.to_string());
    }
    if has_seg {
        channels.push(SEG_CHANNEL.to_string());
    }
    channels.extend(fluorescence.into_iter().map(|n| format!("fl_{n}")));
    FovEntry {
        fov_id,
        path: path.to_string(),
        channels,
        traces_csv: inspected_traces.or(raw_traces),
    }
}
