//! Top-level curation session: project discovery, visualization of one FOV,
//! frame navigation, cell selection, quality curation and export.
//!
//! All mutation happens through `&mut self` on one thread. Backend work is
//! handed to a [`Dispatcher`] and applied when [`Session::pump`] drains the
//! completions; completions whose token was superseded are dropped.

use crate::backend::{ChannelMeta, HttpBackend, SharedBackend};
use crate::config::ViewerConfig;
use crate::error::{CurationError, CurationResult, ErrorCode};
use crate::fetcher::{
    BackendCompletion, BackendJob, BackendOutcome, BackendRequest, BackgroundDispatcher,
    Dispatcher, InitPayload, RequestToken,
};
use crate::frame_view::{FrameApplied, FrameView, ShowOutcome, ViewState};
use crate::overlay::{OverlayMarker, markers_for_frame, nearest};
use crate::pagination::Pager;
use crate::project::Project;
use crate::render_chart::{ChartSeries, page_series, render_chart_svg};
use crate::trace_store::{CellId, LoadSummary, TraceSet, inspected_path};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Discovering,
    Ready,
    Visualizing,
    VisualizingError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualizeRequest {
    pub fov_id: u32,
    pub channels: Vec<String>,
    pub force_rebuild: bool,
}

impl VisualizeRequest {
    pub fn new(fov_id: u32, channels: &[&str]) -> Self {
        Self {
            fov_id,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            force_rebuild: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FailedAction {
    Visualize(VisualizeRequest),
    Frame,
}

pub struct Session {
    config: ViewerConfig,
    dispatcher: Box<dyn Dispatcher>,
    state: SessionState,
    last_error: Option<CurationError>,
    project: Option<Project>,
    next_token: RequestToken,
    pending_discovery: Option<RequestToken>,
    pending_init: Option<(RequestToken, VisualizeRequest)>,
    active: Option<VisualizeRequest>,
    failed: Option<FailedAction>,
    traces: TraceSet,
    traces_path: Option<String>,
    load_summary: Option<LoadSummary>,
    selected: Option<CellId>,
    pager: Pager,
    view: FrameView,
}

impl Session {
    pub fn new(config: ViewerConfig, dispatcher: Box<dyn Dispatcher>) -> Self {
        Self {
            pager: Pager::new(config.page_size),
            view: FrameView::new(config.frame_cache_capacity, config.marker_radius),
            config,
            dispatcher,
            state: SessionState::Empty,
            last_error: None,
            project: None,
            next_token: 0,
            pending_discovery: None,
            pending_init: None,
            active: None,
            failed: None,
            traces: TraceSet::default(),
            traces_path: None,
            load_summary: None,
            selected: None,
        }
    }

    /// Session against the configured HTTP backend, with a background worker.
    pub fn connect(config: ViewerConfig) -> CurationResult<Self> {
        let backend = HttpBackend::new(
            &config.backend_url,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Self::with_backend(config, Arc::new(backend))
    }

    pub fn with_backend(config: ViewerConfig, backend: SharedBackend) -> CurationResult<Self> {
        let dispatcher = BackgroundDispatcher::spawn(backend, config.fetch_workers)?;
        Ok(Self::new(config, Box::new(dispatcher)))
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&CurationError> {
        self.last_error.as_ref()
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    /// True while a discovery, init or frame fetch is outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending_discovery.is_some() || self.pending_init.is_some() || self.view.is_loading()
    }

    pub fn active_request(&self) -> Option<&VisualizeRequest> {
        self.active.as_ref()
    }

    pub fn channels(&self) -> &[ChannelMeta] {
        self.view.channels()
    }

    pub fn current_channel(&self) -> Option<&str> {
        self.view.current_channel()
    }

    pub fn current_frame(&self) -> usize {
        self.view.current_frame()
    }

    pub fn view_state(&self) -> &ViewState {
        self.view.state()
    }

    pub fn raster(&self) -> Option<&RgbaImage> {
        self.view.raster()
    }

    pub fn markers(&self) -> &[OverlayMarker] {
        self.view.markers()
    }

    pub fn traces(&self) -> &TraceSet {
        &self.traces
    }

    pub fn traces_path(&self) -> Option<&str> {
        self.traces_path.as_deref()
    }

    pub fn load_summary(&self) -> Option<&LoadSummary> {
        self.load_summary.as_ref()
    }

    pub fn selected(&self) -> Option<CellId> {
        self.selected
    }

    pub fn page_index(&self) -> usize {
        self.pager.current()
    }

    pub fn page_count(&self) -> usize {
        self.pager.count(&self.traces)
    }

    pub fn page_cells(&self) -> Vec<CellId> {
        self.pager.cells(&self.traces)
    }

    pub fn chart_series(&self) -> Vec<ChartSeries> {
        page_series(&self.traces, &self.page_cells(), self.selected)
    }

    pub fn chart_svg(&self) -> String {
        let frame = self.view.current_channel().map(|_| self.view.current_frame());
        render_chart_svg(&self.chart_series(), frame)
    }

    // Project and visualization

    /// Starts discovery of `output_dir`. Valid from any state; supersedes
    /// any discovery or init still in flight.
    pub fn submit_project(&mut self, output_dir: &str) -> CurationResult<()> {
        let token = self.issue_token();
        self.pending_discovery = Some(token);
        self.pending_init = None;
        self.last_error = None;
        self.state = SessionState::Discovering;
        log::info!("Discovering project in {output_dir}");
        let request = BackendRequest {
            token,
            job: BackendJob::Discover {
                output_dir: output_dir.to_string(),
            },
        };
        if let Err(e) = self.dispatcher.dispatch(request) {
            self.pending_discovery = None;
            self.state = SessionState::Empty;
            return Err(self.record(e));
        }
        Ok(())
    }

    /// Requests channel initialization for one FOV. The current view, if
    /// any, stays until the init succeeds.
    pub fn visualize(&mut self, request: VisualizeRequest) -> CurationResult<()> {
        self.require(&[
            SessionState::Ready,
            SessionState::Visualizing,
            SessionState::VisualizingError,
        ])?;
        let project = self
            .project
            .as_ref()
            .ok_or_else(|| CurationError::invalid_state("no project is loaded"))?;
        if let Err(e) = project.check_channels(request.fov_id, &request.channels) {
            return Err(self.record(e));
        }
        let output_dir = project.output_dir.clone();
        let discovered_traces = project.fov(request.fov_id)?.traces_csv.clone();

        let token = self.issue_token();
        self.pending_init = Some((token, request.clone()));
        self.state = SessionState::Visualizing;
        log::info!(
            "Initializing FOV {} with channels {:?}",
            request.fov_id,
            request.channels
        );
        let job = BackendJob::InitChannels {
            output_dir,
            fov_id: request.fov_id,
            channels: request.channels.clone(),
            force_rebuild: request.force_rebuild,
            discovered_traces,
        };
        if let Err(e) = self.dispatcher.dispatch(BackendRequest { token, job }) {
            self.pending_init = None;
            self.fail_visualization(e.clone(), FailedAction::Visualize(request));
            return Err(e);
        }
        Ok(())
    }

    /// Re-issues whatever put the session into `VisualizingError`.
    pub fn retry(&mut self) -> CurationResult<()> {
        self.require(&[SessionState::VisualizingError])?;
        match self.failed.take() {
            Some(FailedAction::Visualize(request)) => self.visualize(request),
            Some(FailedAction::Frame) => {
                self.state = SessionState::Visualizing;
                self.last_error = None;
                let outcome = self.view.reload()?;
                self.after_show(outcome)
            }
            None => Err(CurationError::invalid_state("nothing to retry")),
        }
    }

    /// Applies every completion the dispatcher has delivered so far.
    /// Returns how many were applied rather than dropped as stale.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        for completion in self.dispatcher.poll() {
            if self.apply(completion) {
                applied += 1;
            }
        }
        applied
    }

    fn apply(&mut self, completion: BackendCompletion) -> bool {
        let token = completion.token;
        match completion.outcome {
            BackendOutcome::Discovered(result) => {
                if self.pending_discovery != Some(token) {
                    log::debug!("Dropping stale discovery result {token}");
                    return false;
                }
                self.pending_discovery = None;
                self.apply_discovery(result);
                true
            }
            BackendOutcome::Initialized(result) => {
                let request = match self.pending_init.take() {
                    Some((pending, request)) if pending == token => request,
                    other => {
                        self.pending_init = other;
                        log::debug!("Dropping stale init result {token}");
                        return false;
                    }
                };
                self.apply_init(request, result);
                true
            }
            BackendOutcome::Frame {
                channel_id,
                frame_index,
                result,
            } => match self.view.complete(token, &channel_id, frame_index, result) {
                FrameApplied::Rendered => true,
                FrameApplied::Failed(e) => {
                    self.fail_visualization(e, FailedAction::Frame);
                    true
                }
                FrameApplied::Stale => false,
            },
        }
    }

    fn apply_discovery(&mut self, result: CurationResult<Project>) {
        self.clear_visualization();
        match result {
            Ok(project) => {
                log::info!(
                    "Project ready: {} FOV(s) in {}",
                    project.fov_ids().len(),
                    project.output_dir
                );
                self.project = Some(project);
                self.state = SessionState::Ready;
            }
            Err(e) => {
                log::error!("Discovery failed: {e}");
                self.project = None;
                self.state = SessionState::Empty;
                self.last_error = Some(e);
            }
        }
    }

    fn apply_init(&mut self, request: VisualizeRequest, result: CurationResult<InitPayload>) {
        let payload = match result {
            Ok(payload) if payload.init.channels.is_empty() => {
                let e = CurationError::backend(format!(
                    "FOV {} initialized without any channel",
                    request.fov_id
                ));
                return self.fail_visualization(e, FailedAction::Visualize(request));
            }
            Ok(payload) => payload,
            Err(e) => return self.fail_visualization(e, FailedAction::Visualize(request)),
        };

        let mut trace_error = None;
        let (traces, summary) = match payload.traces_text {
            None => (TraceSet::default(), None),
            Some(Ok(text)) => match TraceSet::load(&text) {
                Ok((traces, summary)) => (traces, Some(summary)),
                Err(e) => {
                    trace_error = Some(e);
                    (TraceSet::default(), None)
                }
            },
            Some(Err(e)) => {
                trace_error = Some(e);
                (TraceSet::default(), None)
            }
        };
        if let Some(e) = &trace_error {
            log::warn!("FOV {} shown without traces: {e}", request.fov_id);
        }

        self.view.install(payload.init.channels);
        self.traces = traces;
        self.traces_path = payload.traces_path;
        self.load_summary = summary;
        self.selected = None;
        self.pager.reset();
        self.active = Some(request);
        self.failed = None;
        self.last_error = trace_error;
        self.state = SessionState::Visualizing;
        log::info!(
            "Visualizing FOV {} ({} channel(s), {} trace(s))",
            payload.init.fov_id,
            self.view.channels().len(),
            self.traces.len()
        );

        let first = self.view.channels()[0].channel_id.clone();
        let shown = self.view.show(&first, 0).and_then(|outcome| self.after_show(outcome));
        if let Err(e) = shown {
            self.fail_visualization(e, FailedAction::Frame);
        }
    }

    // Frames

    pub fn show_frame(&mut self, frame_index: usize) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        let channel_id = self
            .view
            .current_channel()
            .ok_or_else(|| CurationError::invalid_state("no channel is shown"))?
            .to_string();
        let outcome = self.view.show(&channel_id, frame_index)?;
        self.after_show(outcome)
    }

    /// Moves by `delta` frames, clamped to the current channel.
    pub fn step(&mut self, delta: isize) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        match self.view.step(delta)? {
            Some(outcome) => self.after_show(outcome),
            None => Ok(()),
        }
    }

    pub fn switch_channel(&mut self, channel_id: &str) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        let outcome = self.view.switch_channel(channel_id)?;
        self.after_show(outcome)
    }

    pub fn save_png(&self, path: &Path) -> CurationResult<()> {
        self.view.save_png(path)
    }

    fn after_show(&mut self, outcome: ShowOutcome) -> CurationResult<()> {
        self.refresh_markers();
        let ShowOutcome::Pending(ticket) = outcome else {
            return Ok(());
        };
        let request = BackendRequest {
            token: ticket.token,
            job: BackendJob::Frame {
                meta: ticket.meta,
                frame_index: ticket.frame_index,
            },
        };
        if let Err(e) = self.dispatcher.dispatch(request) {
            self.fail_visualization(e.clone(), FailedAction::Frame);
            return Err(e);
        }
        Ok(())
    }

    // Selection

    /// Selects the marker nearest to an image-space click, or clears the
    /// selection on a miss. Returns the new selection.
    pub fn click(&mut self, x: f64, y: f64) -> CurationResult<Option<CellId>> {
        self.require(&[SessionState::Visualizing])?;
        match nearest(self.view.markers(), x, y, self.config.click_radius) {
            Some(cell_id) => {
                self.select_cell(cell_id)?;
                Ok(Some(cell_id))
            }
            None => {
                self.clear_selection()?;
                Ok(None)
            }
        }
    }

    /// Selects `cell_id` and moves the pager to its page.
    pub fn select_cell(&mut self, cell_id: CellId) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        self.pager.jump_to(&self.traces, &cell_id)?;
        self.selected = Some(cell_id);
        self.refresh_markers();
        Ok(())
    }

    pub fn clear_selection(&mut self) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        self.selected = None;
        self.refresh_markers();
        Ok(())
    }

    // Quality

    pub fn toggle_quality(&mut self, cell_id: CellId) -> CurationResult<bool> {
        self.require(&[SessionState::Visualizing])?;
        let good = self.traces.toggle_quality(&cell_id)?;
        self.refresh_markers();
        Ok(good)
    }

    pub fn set_quality(&mut self, cell_id: CellId, good: bool) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        self.traces.set_quality(&cell_id, good)?;
        self.refresh_markers();
        Ok(())
    }

    pub fn toggle_selected(&mut self) -> CurationResult<bool> {
        let cell_id = self
            .selected
            .ok_or_else(|| CurationError::invalid_state("no cell is selected"))?;
        self.toggle_quality(cell_id)
    }

    // Pages

    pub fn next_page(&mut self) -> CurationResult<usize> {
        self.require(&[SessionState::Visualizing])?;
        Ok(self.pager.advance(&self.traces, 1))
    }

    pub fn prev_page(&mut self) -> CurationResult<usize> {
        self.require(&[SessionState::Visualizing])?;
        Ok(self.pager.advance(&self.traces, -1))
    }

    pub fn set_page(&mut self, page_index: usize) -> CurationResult<()> {
        self.require(&[SessionState::Visualizing])?;
        self.pager.set(&self.traces, page_index)
    }

    // Export

    pub fn export(&self) -> CurationResult<String> {
        self.require_dataset()?;
        self.traces.export()
    }

    /// Writes the curated dataset next to the loaded one. The dataset path
    /// comes from the backend, so this only works when the backend shares
    /// this machine's filesystem; use `save_inspected_in` otherwise.
    pub fn save_inspected(&self) -> CurationResult<PathBuf> {
        let source = self.require_dataset()?;
        self.traces
            .save_inspected(Path::new(source), &self.config.export_suffix)
    }

    /// Writes the curated dataset into a local directory, under the name
    /// `save_inspected` would use.
    pub fn save_inspected_in(&self, local_dir: &Path) -> CurationResult<PathBuf> {
        let source = self.require_dataset()?;
        let remote = inspected_path(Path::new(source), &self.config.export_suffix);
        let name = remote.file_name().ok_or_else(|| {
            CurationError::new(ErrorCode::Io, format!("no file name in '{source}'"))
        })?;
        let target = local_dir.join(name);
        self.traces.write_export(&target)?;
        Ok(target)
    }

    fn require_dataset(&self) -> CurationResult<&str> {
        self.traces_path
            .as_deref()
            .ok_or_else(|| CurationError::invalid_state("no trace dataset is loaded"))
    }

    fn require(&self, allowed: &[SessionState]) -> CurationResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CurationError::invalid_state(format!(
                "operation not available while {:?}",
                self.state
            )))
        }
    }

    fn issue_token(&mut self) -> RequestToken {
        self.next_token += 1;
        self.next_token
    }

    fn record(&mut self, e: CurationError) -> CurationError {
        log::error!("{e}");
        self.last_error = Some(e.clone());
        e
    }

    fn fail_visualization(&mut self, e: CurationError, action: FailedAction) {
        log::error!("Visualization failed: {e}");
        self.last_error = Some(e);
        self.failed = Some(action);
        self.state = SessionState::VisualizingError;
    }

    fn clear_visualization(&mut self) {
        self.view.install(vec![]);
        self.traces = TraceSet::default();
        self.traces_path = None;
        self.load_summary = None;
        self.selected = None;
        self.pager.reset();
        self.active = None;
        self.failed = None;
    }

    fn refresh_markers(&mut self) {
        if self.view.current_channel().is_none() {
            return;
        }
        let markers = markers_for_frame(&self.traces, self.view.current_frame(), self.selected);
        self.view.redraw(markers);
    }
}
