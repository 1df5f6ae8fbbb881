pub mod backend;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod frame_cache;
pub mod frame_view;
pub mod overlay;
pub mod pagination;
pub mod project;
pub mod render_chart;
pub mod render_frame;
pub mod session;
pub mod trace_store;

pub use error::{CurationError, CurationResult, ErrorCode};
pub use session::{Session, SessionState, VisualizeRequest};
