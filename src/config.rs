use crate::error::{CurationError, CurationResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_EXPORT_SUFFIX: &str = "_inspected";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub backend_url: String,
    pub page_size: usize,
    /// Maximum click distance, in image pixels, for selecting a marker.
    pub click_radius: f64,
    pub marker_radius: u32,
    pub frame_cache_capacity: usize,
    pub export_suffix: String,
    pub request_timeout_secs: u64,
    /// Backend requests that may run at the same time.
    pub fetch_workers: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            click_radius: 20.0,
            marker_radius: 6,
            frame_cache_capacity: 32,
            export_suffix: DEFAULT_EXPORT_SUFFIX.to_string(),
            request_timeout_secs: 30,
            fetch_workers: 4,
        }
    }
}

impl ViewerConfig {
    pub fn load_from_path(path: &Path) -> CurationResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CurationError::new(
                ErrorCode::Io,
                format!("Could not read config file '{}': {e}", path.display()),
            )
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            CurationError::new(
                ErrorCode::Io,
                format!("Could not parse config JSON '{}': {e}", path.display()),
            )
        })?;
        config.validated()
    }

    pub fn save_to_path(&self, path: &Path) -> CurationResult<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            CurationError::new(ErrorCode::Io, format!("Could not serialize config: {e}"))
        })?;
        std::fs::write(path, text).map_err(|e| {
            CurationError::new(
                ErrorCode::Io,
                format!("Could not write config file '{}': {e}", path.display()),
            )
        })
    }

    fn validated(self) -> CurationResult<Self> {
        if self.page_size == 0 {
            return Err(CurationError::range("page_size must be positive"));
        }
        if !self.click_radius.is_finite() || self.click_radius < 0.0 {
            return Err(CurationError::range("click_radius must be a non-negative number"));
        }
        if self.fetch_workers == 0 {
            return Err(CurationError::range("fetch_workers must be positive"));
        }
        if self.export_suffix.trim().is_empty() {
            return Err(CurationError::new(
                ErrorCode::Io,
                "export_suffix must not be empty, the input file would be overwritten",
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let td = tempdir().unwrap();
        let path = td.path().join("viewer.json");
        std::fs::write(&path, r#"{"page_size": 25}"#).unwrap();
        let config = ViewerConfig::load_from_path(&path).unwrap();
        assert_eq!(config.page_size, 25);
        assert_eq!(config.export_suffix, "_inspected");
        assert_eq!(config.frame_cache_capacity, 32);
        assert_eq!(config.fetch_workers, 4);
    }

    #[test]
    fn test_save_then_load() {
        let td = tempdir().unwrap();
        let path = td.path().join("viewer.json");
        let config = ViewerConfig {
            backend_url: "http://analysis:9000".to_string(),
            click_radius: 12.5,
            ..ViewerConfig::default()
        };
        config.save_to_path(&path).unwrap();
        assert_eq!(ViewerConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let td = tempdir().unwrap();
        let path = td.path().join("viewer.json");
        std::fs::write(&path, r#"{"page_size": 0}"#).unwrap();
        let err = ViewerConfig::load_from_path(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::Range);
    }
}
