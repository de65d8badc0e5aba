use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureHandle, CaptureSource};
use crate::config::CameraConfig;
use crate::frame_cache::{FrameCache, StreamState};
use crate::utils::redact_url;

/// Delay before retrying a failed connection attempt.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Delay after a failed frame read before reconnecting.
pub const READ_FAILURE_DELAY: Duration = Duration::from_secs(2);
/// Delay after an unexpected capture error before reconnecting.
pub const ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);
/// How long `stop` waits for the capture loop to finish.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Keeps the latest frame of one camera in its `FrameCache`, reconnecting
/// whenever the stream fails.
pub struct CameraStreamWorker {
    camera: CameraConfig,
    source: Arc<dyn CaptureSource>,
    cache: Arc<FrameCache>,
    parent_token: CancellationToken,
    running: Option<RunningLoop>,
}

struct RunningLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CameraStreamWorker {
    pub fn new(camera: CameraConfig, source: Arc<dyn CaptureSource>, shutdown: CancellationToken) -> Self {
        let cache = Arc::new(FrameCache::new(camera.id.clone()));
        Self {
            camera,
            source,
            cache,
            parent_token: shutdown,
            running: None,
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn cache(&self) -> Arc<FrameCache> {
        self.cache.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().map_or(false, |r| !r.task.is_finished())
    }

    /// Launch the capture loop. No-op while a loop is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!(camera = %self.camera.id, "Stream worker already running");
            return;
        }

        let token = self.parent_token.child_token();
        let capture_loop = CaptureLoop {
            camera_id: self.camera.id.clone(),
            camera_name: self.camera.name.clone(),
            url: self.camera.url.clone(),
            source: self.source.clone(),
            cache: self.cache.clone(),
            token: token.clone(),
            handle: None,
        };
        let task = tokio::spawn(capture_loop.run());
        self.running = Some(RunningLoop { token, task });
        info!(camera = %self.camera.id, "Started streaming for {}", self.camera.name);
    }

    /// Ask the capture loop to exit and wait up to `STOP_JOIN_TIMEOUT` for it.
    ///
    /// Reads and connects are raced against cancellation, so the loop always
    /// reaches `CaptureHandle::release` on the way out. The timeout only
    /// fires when that release itself stalls; the task is then aborted and
    /// the half-released handle is dropped, which kills its process.
    pub async fn stop(&mut self) {
        let Some(RunningLoop { token, mut task }) = self.running.take() else {
            return;
        };
        token.cancel();

        match tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(camera = %self.camera.id, "Capture task failed: {}", e),
            Err(_) => {
                warn!(camera = %self.camera.id, "Capture loop did not exit within {}s, aborting",
                      STOP_JOIN_TIMEOUT.as_secs());
                task.abort();
            }
        }
        self.cache.set_state(StreamState::Disconnected);
        info!(camera = %self.camera.id, "Stopped streaming for {}", self.camera.name);
    }
}

struct CaptureLoop {
    camera_id: String,
    camera_name: String,
    url: String,
    source: Arc<dyn CaptureSource>,
    cache: Arc<FrameCache>,
    token: CancellationToken,
    handle: Option<Box<dyn CaptureHandle>>,
}

enum ReadOutcome {
    Frame(bytes::Bytes),
    ReadFailed,
    Fault(crate::errors::StreamError),
    Cancelled,
}

impl CaptureLoop {
    async fn run(mut self) {
        while !self.token.is_cancelled() {
            if self.handle.is_none() {
                if !self.connect().await {
                    self.pause(CONNECT_RETRY_DELAY).await;
                }
                continue;
            }

            match self.read().await {
                ReadOutcome::Frame(data) => self.cache.store(data),
                ReadOutcome::ReadFailed => {
                    warn!(camera = %self.camera_id, "Failed to read frame from {}", self.camera_name);
                    self.release().await;
                    self.pause(READ_FAILURE_DELAY).await;
                }
                ReadOutcome::Fault(e) => {
                    error!(camera = %self.camera_id, "Capture error on {}: {}", self.camera_name, e);
                    self.release().await;
                    self.pause(ERROR_RETRY_DELAY).await;
                }
                ReadOutcome::Cancelled => break,
            }
        }

        self.release().await;
        debug!(camera = %self.camera_id, "Capture loop exited");
    }

    async fn connect(&mut self) -> bool {
        self.cache.set_state(StreamState::Connecting);
        info!(camera = %self.camera_id, "Connecting to {} ({})", self.camera_name, redact_url(&self.url));

        let opened = tokio::select! {
            result = self.source.open(&self.url) => result,
            _ = self.token.cancelled() => return false,
        };

        match opened {
            Ok(handle) => {
                self.handle = Some(handle);
                self.cache.set_state(StreamState::Streaming);
                info!(camera = %self.camera_id, "Connected to {}", self.camera_name);
                true
            }
            Err(e) => {
                error!(camera = %self.camera_id, "Error connecting to {}: {}", self.camera_name, e);
                false
            }
        }
    }

    async fn read(&mut self) -> ReadOutcome {
        let Some(handle) = self.handle.as_mut() else {
            return ReadOutcome::ReadFailed;
        };
        tokio::select! {
            result = handle.read_frame() => match result {
                Ok(Some(data)) => ReadOutcome::Frame(data),
                Ok(None) => ReadOutcome::ReadFailed,
                Err(e) => ReadOutcome::Fault(e),
            },
            _ = self.token.cancelled() => ReadOutcome::Cancelled,
        }
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release().await;
            info!(camera = %self.camera_id, "Released connection to {}", self.camera_name);
        }
        self.cache.set_state(StreamState::Disconnected);
    }

    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.token.cancelled() => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::{Result, StreamError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn camera(id: &str, url: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: format!("Camera {}", id),
            url: url.to_string(),
            enabled: true,
        }
    }

    #[derive(Clone, Copy)]
    pub(crate) enum Step {
        Frame(u8),
        Fail,
        Fault,
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct Counters {
        pub opens: AtomicUsize,
        pub open_attempts: AtomicUsize,
        pub releases: AtomicUsize,
    }

    /// Fake capture source: refuses the first `refuse` opens, then hands out
    /// handles that replay `script` followed by an endless frame supply.
    pub(crate) struct FakeSource {
        pub counters: Arc<Counters>,
        refuse: AtomicUsize,
        script: Mutex<VecDeque<Step>>,
        release_delay: Duration,
    }

    impl FakeSource {
        pub(crate) fn new(refuse: usize, script: Vec<Step>) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                refuse: AtomicUsize::new(refuse),
                script: Mutex::new(script.into()),
                release_delay: Duration::ZERO,
            }
        }

        pub(crate) fn unreachable() -> Self {
            Self::new(usize::MAX, Vec::new())
        }

        pub(crate) fn with_release_delay(mut self, delay: Duration) -> Self {
            self.release_delay = delay;
            self
        }
    }

    #[async_trait]
    impl CaptureSource for FakeSource {
        async fn open(&self, _url: &str) -> Result<Box<dyn CaptureHandle>> {
            self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self.refuse.load(Ordering::SeqCst);
            if refuse > 0 {
                if refuse != usize::MAX {
                    self.refuse.store(refuse - 1, Ordering::SeqCst);
                }
                return Err(StreamError::capture("connection refused"));
            }
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            Ok(Box::new(FakeHandle {
                counters: self.counters.clone(),
                script,
                released: false,
                release_delay: self.release_delay,
            }))
        }
    }

    struct FakeHandle {
        counters: Arc<Counters>,
        script: VecDeque<Step>,
        released: bool,
        release_delay: Duration,
    }

    #[async_trait]
    impl CaptureHandle for FakeHandle {
        async fn read_frame(&mut self) -> Result<Option<Bytes>> {
            let step = self.script.pop_front().unwrap_or(Step::Frame(0xAA));
            match step {
                Step::Frame(b) => {
                    sleep(Duration::from_millis(100)).await;
                    Ok(Some(Bytes::from(vec![b; 16])))
                }
                Step::Fail => Ok(None),
                Step::Fault => Err(StreamError::capture("decoder crashed")),
                Step::Hang => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }
        }

        async fn release(&mut self) {
            assert!(!self.released, "handle released twice");
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            if !self.release_delay.is_zero() {
                sleep(self.release_delay).await;
            }
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_capture_loop_future_is_send() {
        let capture_loop = CaptureLoop {
            camera_id: "cam1".into(),
            camera_name: "Camera cam1".into(),
            url: "rtsp://cam/1".into(),
            source: Arc::new(FakeSource::unreachable()),
            cache: Arc::new(FrameCache::new("cam1")),
            token: CancellationToken::new(),
            handle: None,
        };
        assert_send(&capture_loop.run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_camera_retries_every_five_seconds() {
        let source = Arc::new(FakeSource::unreachable());
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://bad-host/x"), source, CancellationToken::new());
        worker.start();

        sleep(Duration::from_secs(21)).await;
        // Attempts at t = 0, 5, 10, 15, 20.
        assert_eq!(counters.open_attempts.load(Ordering::SeqCst), 5);
        assert!(worker.is_running());
        assert_eq!(worker.cache().state(), StreamState::Connecting);
        assert!(worker.cache().get_frame().is_none());

        worker.stop().await;
        assert!(!worker.is_running());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_reach_the_cache() {
        let source = Arc::new(FakeSource::new(0, vec![Step::Frame(1), Step::Frame(2)]));
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();

        sleep(Duration::from_millis(250)).await;
        let frame = worker.cache().get_frame().unwrap();
        assert_eq!(frame.data[0], 2);
        assert_eq!(worker.cache().state(), StreamState::Streaming);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_reconnects_after_backoff() {
        let source = Arc::new(FakeSource::new(0, vec![Step::Fail]));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        worker.stop().await;
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_waits_longer_before_reconnecting() {
        let source = Arc::new(FakeSource::new(0, vec![Step::Fault]));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();

        sleep(Duration::from_secs(4)).await;
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_blocked_read_is_bounded_and_releases_once() {
        let source = Arc::new(FakeSource::new(0, vec![Step::Hang]));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();
        sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        worker.stop().await;
        assert!(started.elapsed() <= STOP_JOIN_TIMEOUT);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        // A second stop is a no-op.
        worker.stop().await;
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_release_is_invoked_and_stop_stays_bounded() {
        let source = Arc::new(FakeSource::new(0, vec![Step::Hang]).with_release_delay(Duration::from_secs(60)));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();
        sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        worker.stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= STOP_JOIN_TIMEOUT);
        assert!(elapsed < STOP_JOIN_TIMEOUT + Duration::from_millis(100));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert_eq!(worker.cache().state(), StreamState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_restartable() {
        let source = Arc::new(FakeSource::new(0, Vec::new()));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(
            camera("cam1", "rtsp://cam/1"), source, CancellationToken::new());
        worker.start();
        worker.start();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);

        worker.stop().await;
        worker.start();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        worker.stop().await;
        assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_loop() {
        let shutdown = CancellationToken::new();
        let source = Arc::new(FakeSource::new(0, Vec::new()));
        let counters = source.counters.clone();
        let mut worker = CameraStreamWorker::new(camera("cam1", "rtsp://cam/1"), source, shutdown.clone());
        worker.start();
        sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        sleep(Duration::from_millis(10)).await;
        assert!(!worker.is_running());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }
}
