//! Runs backend jobs away from the session and hands completions back.
//!
//! Every job carries the token the caller issued for it. The caller
//! compares tokens when it applies a completion; the background dispatcher
//! only skips frame jobs that a newer one has overtaken before they started.

use crate::backend::{ChannelInit, ChannelMeta, FrameSlice, SharedBackend};
use crate::error::{CurationError, CurationResult, ErrorCode};
use crate::project::Project;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

pub type RequestToken = u64;

#[derive(Debug, Clone)]
pub enum BackendJob {
    Discover {
        output_dir: String,
    },
    InitChannels {
        output_dir: String,
        fov_id: u32,
        channels: Vec<String>,
        force_rebuild: bool,
        /// Trace dataset found during discovery, used when the backend names none.
        discovered_traces: Option<String>,
    },
    Frame {
        meta: ChannelMeta,
        frame_index: usize,
    },
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub token: RequestToken,
    pub job: BackendJob,
}

#[derive(Debug, Clone)]
pub struct InitPayload {
    pub init: ChannelInit,
    pub traces_path: Option<String>,
    /// Raw trace dataset text; `None` when the FOV has no dataset.
    pub traces_text: Option<CurationResult<String>>,
}

#[derive(Debug, Clone)]
pub enum BackendOutcome {
    Discovered(CurationResult<Project>),
    Initialized(CurationResult<InitPayload>),
    Frame {
        channel_id: String,
        frame_index: usize,
        result: CurationResult<Arc<FrameSlice>>,
    },
}

#[derive(Debug, Clone)]
pub struct BackendCompletion {
    pub token: RequestToken,
    pub outcome: BackendOutcome,
}

pub fn run_job(backend: &SharedBackend, job: BackendJob) -> BackendOutcome {
    match job {
        BackendJob::Discover { output_dir } => {
            BackendOutcome::Discovered(Project::discover(backend.as_ref(), &output_dir))
        }
        BackendJob::InitChannels {
            output_dir,
            fov_id,
            channels,
            force_rebuild,
            discovered_traces,
        } => {
            let result = backend
                .init_channels(&output_dir, fov_id, &channels, force_rebuild)
                .map(|init| {
                    let traces_path = init.traces_csv.clone().or(discovered_traces);
                    let traces_text = traces_path.as_deref().map(|p| backend.read_text(p));
                    InitPayload {
                        init,
                        traces_path,
                        traces_text,
                    }
                });
            BackendOutcome::Initialized(result)
        }
        BackendJob::Frame { meta, frame_index } => BackendOutcome::Frame {
            result: backend.get_frame(&meta, frame_index).map(Arc::new),
            channel_id: meta.channel_id,
            frame_index,
        },
    }
}

pub trait Dispatcher {
    fn dispatch(&mut self, request: BackendRequest) -> CurationResult<()>;

    /// Completions that arrived since the last call, in arrival order.
    fn poll(&mut self) -> Vec<BackendCompletion>;
}

/// Executes each job on the calling thread; completions wait for `poll`.
pub struct InlineDispatcher {
    backend: SharedBackend,
    ready: VecDeque<BackendCompletion>,
}

impl InlineDispatcher {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            ready: VecDeque::new(),
        }
    }
}

impl Dispatcher for InlineDispatcher {
    fn dispatch(&mut self, request: BackendRequest) -> CurationResult<()> {
        let outcome = run_job(&self.backend, request.job);
        self.ready.push_back(BackendCompletion {
            token: request.token,
            outcome,
        });
        Ok(())
    }

    fn poll(&mut self) -> Vec<BackendCompletion> {
        self.ready.drain(..).collect()
    }
}

/// Latest frame token dispatched per channel. A frame job that has not
/// started yet is skipped once a newer one for its channel was dispatched.
#[derive(Debug, Default, Clone)]
struct LatestFrames(Arc<Mutex<HashMap<String, RequestToken>>>);

impl LatestFrames {
    fn note(&self, request: &BackendRequest) {
        if let BackendJob::Frame { meta, .. } = &request.job {
            if let Ok(mut latest) = self.0.lock() {
                let entry = latest.entry(meta.channel_id.clone()).or_insert(request.token);
                *entry = (*entry).max(request.token);
            }
        }
    }

    fn is_superseded(&self, request: &BackendRequest) -> bool {
        let BackendJob::Frame { meta, .. } = &request.job else {
            return false;
        };
        match self.0.lock() {
            Ok(latest) => latest
                .get(&meta.channel_id)
                .is_some_and(|&token| token > request.token),
            Err(_) => false,
        }
    }
}

/// Runs every job on a worker pool so a hung request never holds back the
/// ones issued after it.
pub struct BackgroundDispatcher {
    backend: SharedBackend,
    pool: rayon::ThreadPool,
    latest: LatestFrames,
    tx: Sender<BackendCompletion>,
    rx: Receiver<BackendCompletion>,
}

impl BackgroundDispatcher {
    pub fn spawn(backend: SharedBackend, workers: usize) -> CurationResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("backend-fetch-{i}"))
            .build()
            .map_err(|e| {
                CurationError::new(ErrorCode::Io, format!("could not start backend workers: {e}"))
            })?;
        let (tx, rx) = std::sync::mpsc::channel::<BackendCompletion>();
        log::info!("Backend dispatcher started with {} workers", pool.current_num_threads());
        Ok(Self {
            backend,
            pool,
            latest: LatestFrames::default(),
            tx,
            rx,
        })
    }
}

impl Dispatcher for BackgroundDispatcher {
    fn dispatch(&mut self, request: BackendRequest) -> CurationResult<()> {
        self.latest.note(&request);
        let backend = Arc::clone(&self.backend);
        let latest = self.latest.clone();
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            if latest.is_superseded(&request) {
                log::debug!("Dropping superseded frame request {}", request.token);
                return;
            }
            let token = request.token;
            let outcome = run_job(&backend, request.job);
            if tx.send(BackendCompletion { token, outcome }).is_err() {
                log::debug!("Completion {token} dropped, dispatcher is gone");
            }
        });
        Ok(())
    }

    fn poll(&mut self) -> Vec<BackendCompletion> {
        let mut out = vec![];
        loop {
            match self.rx.try_recv() {
                Ok(completion) => out.push(completion),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::error!("Backend completion channel disconnected unexpectedly");
                    break;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DirectoryService, FrameSource, SourceHandle};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use trace_curator_protocol::DirectoryItem;

    struct Flat;

    impl DirectoryService for Flat {
        fn list(&self, _path: &str) -> CurationResult<Vec<DirectoryItem>> {
            Ok(vec![])
        }

        fn read_text(&self, path: &str) -> CurationResult<String> {
            Ok(format!("contents of {path}"))
        }
    }

    impl FrameSource for Flat {
        fn init_channels(
            &self,
            _output_dir: &str,
            fov_id: u32,
            _channel_ids: &[String],
            _force_rebuild: bool,
        ) -> CurationResult<ChannelInit> {
            Ok(ChannelInit {
                fov_id,
                channels: vec![meta("pc")],
                traces_csv: None,
            })
        }

        fn get_frame(&self, meta: &ChannelMeta, frame_index: usize) -> CurationResult<FrameSlice> {
            meta.check_frame(frame_index)?;
            Ok(FrameSlice {
                width: 1,
                height: 1,
                samples: vec![frame_index as f32],
            })
        }
    }

    fn meta(channel: &str) -> ChannelMeta {
        ChannelMeta {
            channel_id: channel.to_string(),
            dtype: "uint16".to_string(),
            shape: vec![4, 1, 1],
            n_frames: 4,
            intensity_min: 0.0,
            intensity_max: 10.0,
            source_handle: SourceHandle(format!("/cache/{channel}.npy")),
        }
    }

    fn frame_request(token: RequestToken, channel: &str, frame_index: usize) -> BackendRequest {
        BackendRequest {
            token,
            job: BackendJob::Frame {
                meta: meta(channel),
                frame_index,
            },
        }
    }

    #[test]
    fn test_inline_dispatch_queues_until_poll() {
        let mut dispatcher = InlineDispatcher::new(Arc::new(Flat));
        dispatcher.dispatch(frame_request(1, "pc", 2)).unwrap();
        dispatcher.dispatch(frame_request(2, "pc", 9)).unwrap();
        let done = dispatcher.poll();
        assert_eq!(done.len(), 2);
        match &done[0].outcome {
            BackendOutcome::Frame { result, .. } => {
                assert_eq!(result.as_ref().unwrap().samples, vec![2.0])
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match &done[1].outcome {
            BackendOutcome::Frame { result, .. } => {
                assert_eq!(result.as_ref().unwrap_err().code, ErrorCode::Range)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(dispatcher.poll().is_empty());
    }

    #[test]
    fn test_init_falls_back_to_discovered_traces() {
        let backend: SharedBackend = Arc::new(Flat);
        let outcome = run_job(
            &backend,
            BackendJob::InitChannels {
                output_dir: "/out".to_string(),
                fov_id: 1,
                channels: vec!["pc".to_string()],
                force_rebuild: false,
                discovered_traces: Some("/out/fov_001/a_traces.csv".to_string()),
            },
        );
        let BackendOutcome::Initialized(Ok(payload)) = outcome else {
            panic!("init failed");
        };
        assert_eq!(payload.traces_path.as_deref(), Some("/out/fov_001/a_traces.csv"));
        assert_eq!(
            payload.traces_text.unwrap().unwrap(),
            "contents of /out/fov_001/a_traces.csv"
        );
    }

    #[test]
    fn test_superseded_frame_requests_are_skipped() {
        let latest = LatestFrames::default();
        let requests = [
            frame_request(1, "pc", 0),
            frame_request(2, "fl_1", 0),
            frame_request(3, "pc", 1),
            frame_request(4, "pc", 2),
        ];
        for request in &requests {
            latest.note(request);
        }
        let live: Vec<RequestToken> = requests
            .iter()
            .filter(|r| !latest.is_superseded(r))
            .map(|r| r.token)
            .collect();
        assert_eq!(live, vec![2, 4]);
        let discover = BackendRequest {
            token: 0,
            job: BackendJob::Discover {
                output_dir: "/out".to_string(),
            },
        };
        assert!(!latest.is_superseded(&discover));
    }

    #[test]
    fn test_background_dispatcher_delivers_latest_frame() {
        let mut dispatcher = BackgroundDispatcher::spawn(Arc::new(Flat), 2).unwrap();
        dispatcher.dispatch(frame_request(7, "pc", 3)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = vec![];
        while done.is_empty() && Instant::now() < deadline {
            done = dispatcher.poll();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 7);
    }

    /// Frame 1 blocks until released; every other frame answers at once.
    struct Stalling {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl DirectoryService for Stalling {
        fn list(&self, _path: &str) -> CurationResult<Vec<DirectoryItem>> {
            Ok(vec![])
        }

        fn read_text(&self, _path: &str) -> CurationResult<String> {
            Ok(String::new())
        }
    }

    impl FrameSource for Stalling {
        fn init_channels(
            &self,
            _output_dir: &str,
            _fov_id: u32,
            _channel_ids: &[String],
            _force_rebuild: bool,
        ) -> CurationResult<ChannelInit> {
            Err(CurationError::backend("not used"))
        }

        fn get_frame(&self, _meta: &ChannelMeta, frame_index: usize) -> CurationResult<FrameSlice> {
            if frame_index == 1 {
                let _ = self.started.lock().unwrap().send(());
                let release = self.release.lock().unwrap();
                let _ = release.recv_timeout(Duration::from_secs(10));
            }
            Ok(FrameSlice {
                width: 1,
                height: 1,
                samples: vec![frame_index as f32],
            })
        }
    }

    #[test]
    fn test_hung_frame_does_not_block_newer_request() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let backend = Arc::new(Stalling {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let mut dispatcher = BackgroundDispatcher::spawn(backend, 2).unwrap();
        dispatcher.dispatch(frame_request(1, "pc", 1)).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        dispatcher.dispatch(frame_request(2, "pc", 2)).unwrap();

        let started = Instant::now();
        let mut done = vec![];
        while done.is_empty() && started.elapsed() < Duration::from_secs(5) {
            done = dispatcher.poll();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 2);

        release_tx.send(()).unwrap();
        let mut late = vec![];
        while late.is_empty() && started.elapsed() < Duration::from_secs(5) {
            late = dispatcher.poll();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(late.iter().map(|c| c.token).collect::<Vec<_>>(), vec![1]);
    }
}
