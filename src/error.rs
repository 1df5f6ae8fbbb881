use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing FOV, channel or cell.
    NotFound,
    /// Frame or page index out of bounds.
    Range,
    /// Trace dataset is missing required columns.
    Schema,
    /// A single malformed data row.
    RowParse,
    /// Transport or payload failure from an external call.
    Backend,
    /// Operation not valid in the current session state.
    InvalidState,
    Io,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationError {
    pub code: ErrorCode,
    pub message: String,
}

pub type CurationResult<T> = Result<T, CurationError>;

impl CurationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Range, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Schema, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Backend, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }
}

impl fmt::Display for CurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for CurationError {}

impl From<std::io::Error> for CurationError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, err.to_string())
    }
}

impl From<csv::Error> for CurationError {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Io(_) => Self::new(ErrorCode::Io, err.to_string()),
            _ => Self::new(ErrorCode::RowParse, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CurationError {
    fn from(err: serde_json::Error) -> Self {
        Self::backend(format!("invalid JSON payload: {err}"))
    }
}

impl From<reqwest::Error> for CurationError {
    fn from(err: reqwest::Error) -> Self {
        Self::backend(format!("request failed: {err}"))
    }
}

impl From<image::ImageError> for CurationError {
    fn from(err: image::ImageError) -> Self {
        Self::new(ErrorCode::Io, format!("could not encode image: {err}"))
    }
}
