//! The displayed frame: which channel and frame are current, which fetch is
//! the latest one per channel, and the rendered raster with its markers.

use crate::backend::{ChannelMeta, FrameSlice};
use crate::error::{CurationError, CurationResult};
use crate::fetcher::RequestToken;
use crate::frame_cache::FrameCache;
use crate::overlay::OverlayMarker;
use crate::render_frame::{draw_markers, render_grayscale};
use image::{ImageFormat, RgbaImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Idle,
    Loading { token: RequestToken },
    Rendered,
    /// The fetch for the current frame failed; the previous raster stays.
    Error(String),
}

/// A fetch the caller has to hand to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTicket {
    pub token: RequestToken,
    pub meta: ChannelMeta,
    pub frame_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShowOutcome {
    /// Served from the frame cache.
    Rendered,
    Pending(FrameTicket),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameApplied {
    Rendered,
    Failed(CurationError),
    /// Superseded by a newer request or a channel/frame change.
    Stale,
}

#[derive(Debug, Clone)]
struct DisplayedFrame {
    channel_id: String,
    frame_index: usize,
    slice: Arc<FrameSlice>,
}

#[derive(Debug)]
pub struct FrameView {
    channels: Vec<ChannelMeta>,
    current_channel: Option<usize>,
    current_frame: usize,
    displayed: Option<DisplayedFrame>,
    raster: Option<RgbaImage>,
    markers: Vec<OverlayMarker>,
    marker_radius: u32,
    latest: HashMap<String, RequestToken>,
    next_token: RequestToken,
    /// Tokens at or below this belong to a previous channel set.
    install_floor: RequestToken,
    cache: FrameCache,
    state: ViewState,
}

impl FrameView {
    pub fn new(cache_capacity: usize, marker_radius: u32) -> Self {
        Self {
            channels: vec![],
            current_channel: None,
            current_frame: 0,
            displayed: None,
            raster: None,
            markers: vec![],
            marker_radius,
            latest: HashMap::new(),
            next_token: 0,
            install_floor: 0,
            cache: FrameCache::new(cache_capacity),
            state: ViewState::Idle,
        }
    }

    /// Replaces the channel set and drops everything tied to the old one.
    pub fn install(&mut self, channels: Vec<ChannelMeta>) {
        self.current_channel = if channels.is_empty() { None } else { Some(0) };
        self.channels = channels;
        self.current_frame = 0;
        self.displayed = None;
        self.raster = None;
        self.markers.clear();
        self.latest.clear();
        self.install_floor = self.next_token;
        self.cache.clear();
        self.state = ViewState::Idle;
    }

    pub fn channels(&self) -> &[ChannelMeta] {
        &self.channels
    }

    pub fn meta(&self, channel_id: &str) -> CurationResult<&ChannelMeta> {
        self.channels
            .iter()
            .find(|c| c.channel_id == channel_id)
            .ok_or_else(|| CurationError::not_found(format!("channel '{channel_id}' is not loaded")))
    }

    pub fn current_meta(&self) -> Option<&ChannelMeta> {
        self.current_channel.and_then(|i| self.channels.get(i))
    }

    pub fn current_channel(&self) -> Option<&str> {
        self.current_meta().map(|m| m.channel_id.as_str())
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Channel and frame of the raster currently on screen.
    pub fn displayed_frame(&self) -> Option<(&str, usize)> {
        self.displayed
            .as_ref()
            .map(|d| (d.channel_id.as_str(), d.frame_index))
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ViewState::Loading { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            ViewState::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn raster(&self) -> Option<&RgbaImage> {
        self.raster.as_ref()
    }

    pub fn markers(&self) -> &[OverlayMarker] {
        &self.markers
    }

    pub fn cached_frames(&self) -> usize {
        self.cache.len()
    }

    /// Makes `(channel_id, frame_index)` current. Out-of-range indices and
    /// unknown channels fail without touching the view.
    pub fn show(&mut self, channel_id: &str, frame_index: usize) -> CurationResult<ShowOutcome> {
        let idx = self
            .channels
            .iter()
            .position(|c| c.channel_id == channel_id)
            .ok_or_else(|| CurationError::not_found(format!("channel '{channel_id}' is not loaded")))?;
        self.channels[idx].check_frame(frame_index)?;

        if frame_index != self.current_frame {
            self.markers.clear();
        }
        self.current_channel = Some(idx);
        self.current_frame = frame_index;
        self.next_token += 1;
        let token = self.next_token;
        self.latest.insert(channel_id.to_string(), token);

        if let Some(slice) = self.cache.get(channel_id, frame_index) {
            log::debug!("Frame {frame_index} of '{channel_id}' served from cache");
            self.display(channel_id, frame_index, slice);
            return Ok(ShowOutcome::Rendered);
        }
        self.state = ViewState::Loading { token };
        Ok(ShowOutcome::Pending(FrameTicket {
            token,
            meta: self.channels[idx].clone(),
            frame_index,
        }))
    }

    /// Moves the current frame by `delta`, clamped to the channel's range.
    /// Returns `None` when the clamped frame is already current.
    pub fn step(&mut self, delta: isize) -> CurationResult<Option<ShowOutcome>> {
        let meta = self
            .current_meta()
            .ok_or_else(|| CurationError::invalid_state("no channel is shown"))?;
        let last = meta.n_frames.saturating_sub(1);
        let target = self.current_frame.saturating_add_signed(delta).min(last);
        if target == self.current_frame {
            return Ok(None);
        }
        let channel_id = meta.channel_id.clone();
        self.show(&channel_id, target).map(Some)
    }

    pub fn switch_channel(&mut self, channel_id: &str) -> CurationResult<ShowOutcome> {
        let n_frames = self.meta(channel_id)?.n_frames;
        let frame = self.current_frame.min(n_frames.saturating_sub(1));
        self.show(channel_id, frame)
    }

    /// Re-requests the current frame, e.g. after a failed fetch.
    pub fn reload(&mut self) -> CurationResult<ShowOutcome> {
        let channel_id = self
            .current_channel()
            .ok_or_else(|| CurationError::invalid_state("no channel is shown"))?
            .to_string();
        self.show(&channel_id, self.current_frame)
    }

    /// Applies a finished fetch. Successful slices are cached even when
    /// stale; only the latest request for the current frame is displayed.
    pub fn complete(
        &mut self,
        token: RequestToken,
        channel_id: &str,
        frame_index: usize,
        result: CurationResult<Arc<FrameSlice>>,
    ) -> FrameApplied {
        if token <= self.install_floor {
            log::debug!("Dropping frame {frame_index} of '{channel_id}' from a previous visualization");
            return FrameApplied::Stale;
        }
        if let Ok(slice) = &result {
            self.cache.insert(channel_id, frame_index, slice.clone());
        }
        let latest = self.latest.get(channel_id) == Some(&token);
        let current =
            self.current_channel() == Some(channel_id) && self.current_frame == frame_index;
        if !latest || !current {
            log::debug!("Dropping stale frame {frame_index} of '{channel_id}' (token {token})");
            return FrameApplied::Stale;
        }
        match result {
            Ok(slice) => {
                self.display(channel_id, frame_index, slice);
                FrameApplied::Rendered
            }
            Err(e) => {
                log::error!("Frame {frame_index} of '{channel_id}' failed: {e}");
                self.state = ViewState::Error(e.message.clone());
                FrameApplied::Failed(e)
            }
        }
    }

    /// Replaces the markers for the current frame and re-renders the raster
    /// if that frame is on screen. No fetch is issued.
    pub fn redraw(&mut self, markers: Vec<OverlayMarker>) {
        self.markers = markers;
        if self.shows_current_frame() {
            self.render();
        }
    }

    pub fn save_png(&self, path: &Path) -> CurationResult<()> {
        let raster = self
            .raster
            .as_ref()
            .ok_or_else(|| CurationError::invalid_state("no frame has been rendered"))?;
        raster.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }

    fn shows_current_frame(&self) -> bool {
        match (&self.displayed, self.current_channel()) {
            (Some(d), Some(channel)) => d.channel_id == channel && d.frame_index == self.current_frame,
            _ => false,
        }
    }

    fn display(&mut self, channel_id: &str, frame_index: usize, slice: Arc<FrameSlice>) {
        self.displayed = Some(DisplayedFrame {
            channel_id: channel_id.to_string(),
            frame_index,
            slice,
        });
        self.render();
        self.state = ViewState::Rendered;
    }

    fn render(&mut self) {
        let Some(displayed) = &self.displayed else {
            return;
        };
        let Some(meta) = self
            .channels
            .iter()
            .find(|c| c.channel_id == displayed.channel_id)
        else {
            return;
        };
        let mut img = render_grayscale(&displayed.slice, meta.intensity_min, meta.intensity_max);
        if displayed.frame_index == self.current_frame {
            draw_markers(&mut img, &self.markers, self.marker_radius);
        }
        self.raster = Some(img);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceHandle;
    use crate::error::ErrorCode;
    use crate::overlay::MarkerState;
    use crate::trace_store::CellId;
    use tempfile::tempdir;

    fn meta(channel: &str, n_frames: usize) -> ChannelMeta {
        ChannelMeta {
            channel_id: channel.to_string(),
            dtype: "uint16".to_string(),
            shape: vec![n_frames, 4, 4],
            n_frames,
            intensity_min: 0.0,
            intensity_max: 100.0,
            source_handle: SourceHandle(format!("/cache/{channel}.npy")),
        }
    }

    fn slice(value: f32) -> Arc<FrameSlice> {
        Arc::new(FrameSlice {
            width: 4,
            height: 4,
            samples: vec![value; 16],
        })
    }

    fn view() -> FrameView {
        let mut view = FrameView::new(8, 1);
        view.install(vec![meta("pc", 5), meta("fl_1", 3)]);
        view
    }

    fn pending(outcome: ShowOutcome) -> FrameTicket {
        match outcome {
            ShowOutcome::Pending(ticket) => ticket,
            ShowOutcome::Rendered => panic!("expected a fetch"),
        }
    }

    #[test]
    fn test_show_then_complete_renders() {
        let mut view = view();
        let ticket = pending(view.show("pc", 2).unwrap());
        assert!(view.is_loading());
        assert_eq!(
            view.complete(ticket.token, "pc", 2, Ok(slice(100.0))),
            FrameApplied::Rendered
        );
        assert_eq!(view.state(), &ViewState::Rendered);
        assert_eq!(view.displayed_frame(), Some(("pc", 2)));
        assert_eq!(view.raster().unwrap().get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_out_of_range_show_changes_nothing() {
        let mut view = view();
        let ticket = pending(view.show("pc", 1).unwrap());
        view.complete(ticket.token, "pc", 1, Ok(slice(1.0)));
        let err = view.show("pc", 5).unwrap_err();
        assert_eq!(err.code, ErrorCode::Range);
        assert_eq!(view.current_frame(), 1);
        assert_eq!(view.displayed_frame(), Some(("pc", 1)));
        assert_eq!(view.show("dic", 0).unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_out_of_order_completion_is_dropped() {
        let mut view = view();
        let first = pending(view.show("pc", 1).unwrap());
        let second = pending(view.show("pc", 2).unwrap());
        assert_eq!(
            view.complete(second.token, "pc", 2, Ok(slice(50.0))),
            FrameApplied::Rendered
        );
        assert_eq!(
            view.complete(first.token, "pc", 1, Ok(slice(0.0))),
            FrameApplied::Stale
        );
        assert_eq!(view.displayed_frame(), Some(("pc", 2)));
        assert_eq!(view.cached_frames(), 2);
    }

    #[test]
    fn test_cached_frame_is_shown_without_fetch() {
        let mut view = view();
        let t = pending(view.show("pc", 3).unwrap());
        view.complete(t.token, "pc", 3, Ok(slice(10.0)));
        let t = pending(view.show("pc", 4).unwrap());
        view.complete(t.token, "pc", 4, Ok(slice(20.0)));
        assert_eq!(view.show("pc", 3).unwrap(), ShowOutcome::Rendered);
        assert_eq!(view.displayed_frame(), Some(("pc", 3)));
    }

    #[test]
    fn test_step_clamps_at_bounds() {
        let mut view = view();
        view.show("pc", 0).unwrap();
        assert_eq!(view.step(-3).unwrap(), None);
        assert_eq!(view.current_frame(), 0);
        pending(view.step(10).unwrap().unwrap());
        assert_eq!(view.current_frame(), 4);
        assert_eq!(view.step(1).unwrap(), None);
        assert_eq!(view.current_frame(), 4);
    }

    #[test]
    fn test_switch_channel_clamps_frame() {
        let mut view = view();
        view.show("pc", 4).unwrap();
        let ticket = pending(view.switch_channel("fl_1").unwrap());
        assert_eq!(ticket.frame_index, 2);
        assert_eq!(view.current_channel(), Some("fl_1"));
        assert_eq!(
            view.switch_channel("seg").unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_failure_keeps_last_raster() {
        let mut view = view();
        let t = pending(view.show("pc", 0).unwrap());
        view.complete(t.token, "pc", 0, Ok(slice(100.0)));
        let t = pending(view.show("pc", 1).unwrap());
        let applied = view.complete(t.token, "pc", 1, Err(CurationError::backend("timeout")));
        assert!(matches!(applied, FrameApplied::Failed(_)));
        assert_eq!(view.error(), Some("timeout"));
        assert!(view.raster().is_some());
        assert_eq!(view.displayed_frame(), Some(("pc", 0)));
    }

    #[test]
    fn test_install_invalidates_in_flight_requests() {
        let mut view = view();
        let t = pending(view.show("pc", 0).unwrap());
        view.install(vec![meta("pc", 5)]);
        assert_eq!(
            view.complete(t.token, "pc", 0, Ok(slice(1.0))),
            FrameApplied::Stale
        );
        assert_eq!(view.cached_frames(), 0);
    }

    #[test]
    fn test_redraw_draws_markers_and_saves_png() {
        let mut view = view();
        let t = pending(view.show("pc", 0).unwrap());
        view.complete(t.token, "pc", 0, Ok(slice(0.0)));
        view.redraw(vec![OverlayMarker {
            cell_id: CellId::new(0, 1),
            x: 2.0,
            y: 2.0,
            state: MarkerState::Excluded,
        }]);
        let raster = view.raster().unwrap();
        assert_eq!(raster.get_pixel(3, 2).0, MarkerState::Excluded.rgba());

        let td = tempdir().unwrap();
        let path = td.path().join("frame.png");
        view.save_png(&path).unwrap();
        assert!(path.exists());
    }
}
