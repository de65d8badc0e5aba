use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, RecordingConfig};
use crate::errors::{Result, StreamError};
use crate::utils::{redact_url, segment_timestamp, Clock};

/// Time allowed for a killed process to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch one recording segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCommand {
    pub camera_id: String,
    pub url: String,
    pub output: PathBuf,
    pub duration: Duration,
}

/// How a segment process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentExit {
    pub code: Option<i32>,
}

impl SegmentExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for SegmentExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running transcoder process.
#[async_trait]
pub trait RecordingProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking poll: `None` while still running.
    fn try_wait(&mut self) -> Result<Option<SegmentExit>>;

    /// Request graceful termination.
    fn terminate(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;

    async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<SegmentExit>>;

    /// Diagnostic output collected from the process so far.
    async fn error_output(&mut self) -> String;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &SegmentCommand) -> Result<Box<dyn RecordingProcess>>;
}

pub struct ActiveSegment {
    process: Box<dyn RecordingProcess>,
    pid: Option<u32>,
    started_at: DateTime<Local>,
    output: PathBuf,
}

/// Per-camera recording slot.
pub enum SegmentState {
    NotStarted,
    Running(ActiveSegment),
    Exited(SegmentExit),
}

impl SegmentState {
    /// Move `Running` to `Exited` once the process has finished.
    fn poll(&mut self, camera_id: &str) {
        let SegmentState::Running(segment) = self else {
            return;
        };
        let exit = match segment.process.try_wait() {
            Ok(Some(exit)) => exit,
            Ok(None) => return,
            Err(e) => {
                warn!(camera = %camera_id, "Failed to poll recording process: {}", e);
                SegmentExit { code: None }
            }
        };
        debug!(camera = %camera_id, "Segment {} ended with {}", segment.output.display(), exit);
        *self = SegmentState::Exited(exit);
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SegmentState::Running(_))
    }
}

/// Keeps a chain of fixed-duration recording segments going for every
/// enabled camera, one transcoder process per camera at a time.
pub struct RecordingSupervisor {
    config: RecordingConfig,
    launcher: Arc<dyn ProcessLauncher>,
    clock: Arc<dyn Clock>,
    segments: HashMap<String, SegmentState>,
}

impl RecordingSupervisor {
    pub fn new(config: RecordingConfig, launcher: Arc<dyn ProcessLauncher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            launcher,
            clock,
            segments: HashMap::new(),
        }
    }

    fn segment_command(&self, camera: &CameraConfig, started_at: &DateTime<Local>) -> SegmentCommand {
        let file_name = format!("{}_{}.{}", camera.id, segment_timestamp(started_at), self.config.container);
        SegmentCommand {
            camera_id: camera.id.clone(),
            url: camera.url.clone(),
            output: self.config.directory.join(file_name),
            duration: self.config.segment_duration(),
        }
    }

    pub fn state(&self, camera_id: &str) -> Option<&SegmentState> {
        self.segments.get(camera_id)
    }

    /// Number of cameras with a segment process that is still running.
    pub fn active_count(&mut self) -> usize {
        let mut active = 0;
        for (camera_id, state) in self.segments.iter_mut() {
            state.poll(camera_id);
            if state.is_running() {
                active += 1;
            }
        }
        active
    }

    /// Launch the next segment for `camera`. No-op while a segment is running.
    pub async fn start_segment(&mut self, camera: &CameraConfig) {
        let slot = self.segments.entry(camera.id.clone()).or_insert(SegmentState::NotStarted);
        slot.poll(&camera.id);
        if slot.is_running() {
            warn!(camera = %camera.id, "Camera is already recording");
            return;
        }
        *slot = SegmentState::NotStarted;

        let started_at = self.clock.now();
        let command = self.segment_command(camera, &started_at);
        info!(camera = %camera.id, "Starting recording for {} ({})", camera.name, redact_url(&camera.url));

        let mut process = match self.launcher.launch(&command) {
            Ok(process) => process,
            Err(StreamError::ToolNotFound { tool }) => {
                error!(camera = %camera.id, "Recording tool '{}' not found, check the FFmpeg installation", tool);
                return;
            }
            Err(e) => {
                error!(camera = %camera.id, "Failed to start recording: {}", e);
                return;
            }
        };

        let grace = self.config.startup_grace();
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        match process.try_wait() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                let output = process.error_output().await;
                error!(camera = %camera.id, "Recording process failed immediately ({}): {}", exit, output.trim());
                return;
            }
            Err(e) => {
                error!(camera = %camera.id, "Failed to poll new recording process: {}", e);
                if let Err(e) = process.kill() {
                    warn!(camera = %camera.id, "Failed to kill recording process: {}", e);
                }
                return;
            }
        }

        let pid = process.id();
        info!(camera = %camera.id, "Recording started - PID: {:?}, file: {}", pid, command.output.display());
        self.segments.insert(
            camera.id.clone(),
            SegmentState::Running(ActiveSegment {
                process,
                pid,
                started_at,
                output: command.output,
            }),
        );
    }

    /// Stop the running segment of `camera_id`, escalating to kill after the stop timeout.
    pub async fn stop_segment(&mut self, camera_id: &str) {
        if let Some(SegmentState::Running(segment)) = self.segments.remove(camera_id) {
            shutdown_segment(camera_id, segment, self.config.stop_timeout()).await;
        }
    }

    pub async fn stop_all(&mut self) {
        let timeout = self.config.stop_timeout();
        let running: Vec<(String, ActiveSegment)> = self.segments
            .drain()
            .filter_map(|(camera_id, state)| match state {
                SegmentState::Running(segment) => Some((camera_id, segment)),
                _ => None,
            })
            .collect();

        join_all(running.into_iter().map(|(camera_id, segment)| async move {
            shutdown_segment(&camera_id, segment, timeout).await;
        }))
        .await;
    }

    /// Restart every enabled camera whose segment has finished or never started.
    pub async fn reconcile(&mut self, cameras: &[CameraConfig]) {
        for camera in cameras.iter().filter(|c| c.enabled) {
            let slot = self.segments.entry(camera.id.clone()).or_insert(SegmentState::NotStarted);
            slot.poll(&camera.id);
            match slot {
                SegmentState::Running(_) => continue,
                SegmentState::Exited(exit) if exit.success() => {
                    info!(camera = %camera.id, "Segment completed for {}", camera.name);
                }
                SegmentState::Exited(exit) => {
                    warn!(camera = %camera.id, "Recording failed for {} ({})", camera.name, exit);
                }
                SegmentState::NotStarted => {}
            }
            *slot = SegmentState::NotStarted;

            info!(camera = %camera.id, "Starting new segment for {}", camera.name);
            self.start_segment(camera).await;
        }
    }
}

async fn shutdown_segment(camera_id: &str, mut segment: ActiveSegment, timeout: Duration) {
    match segment.process.try_wait() {
        Ok(Some(exit)) => {
            debug!(camera = %camera_id, "Recording process already exited ({})", exit);
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(camera = %camera_id, "Failed to poll recording process: {}", e),
    }

    info!(camera = %camera_id, "Stopping recording (PID: {:?}, running since {})",
          segment.pid, segment.started_at.format("%H:%M:%S"));
    if let Err(e) = segment.process.terminate() {
        warn!(camera = %camera_id, "Failed to terminate recording process: {}", e);
    }

    match segment.process.wait_timeout(timeout).await {
        Ok(Some(exit)) => {
            info!(camera = %camera_id, "Recording stopped ({}), file: {}", exit, segment.output.display());
            return;
        }
        Ok(None) => warn!(camera = %camera_id, "Recording process ignored terminate for {}s, killing", timeout.as_secs()),
        Err(e) => warn!(camera = %camera_id, "Failed waiting for recording process: {}, killing", e),
    }

    if let Err(e) = segment.process.kill() {
        warn!(camera = %camera_id, "Failed to kill recording process: {}", e);
    }
    match segment.process.wait_timeout(KILL_REAP_TIMEOUT).await {
        Ok(Some(_)) => info!(camera = %camera_id, "Recording process killed"),
        Ok(None) => error!(camera = %camera_id, "Recording process survived kill"),
        Err(e) => warn!(camera = %camera_id, "Failed to reap killed recording process: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::TokioClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;
    use tokio::time::{sleep, Instant};

    #[derive(Clone, Copy)]
    pub(crate) enum Behavior {
        /// Exits with `code` after `after`, honours terminate.
        ExitAfter(Duration, i32),
        /// Ignores terminate, only dies on kill.
        Stubborn,
        /// Exits with `code` right after launch.
        FailImmediately(i32),
        /// Launch itself fails because the binary is missing.
        NotFound,
        /// Random lifetime and exit code drawn from the launcher's rng.
        Random,
        /// Polling fails and kill reports an error, though the process does die.
        Unpollable,
    }

    #[derive(Default)]
    pub(crate) struct ProcState {
        exits_at: Option<Instant>,
        code: Option<i32>,
        terminated: bool,
        killed: bool,
        honours_terminate: bool,
        unpollable: bool,
    }

    impl ProcState {
        fn exit(&self) -> Option<SegmentExit> {
            if self.killed {
                return Some(SegmentExit { code: None });
            }
            match self.exits_at {
                Some(at) if Instant::now() >= at => Some(SegmentExit { code: self.code }),
                _ => None,
            }
        }
    }

    pub(crate) struct Launch {
        pub command: SegmentCommand,
        pub state: Arc<Mutex<ProcState>>,
    }

    pub(crate) struct FakeLauncher {
        behavior: Behavior,
        rng: Mutex<StdRng>,
        pub launches: Mutex<Vec<Launch>>,
    }

    impl FakeLauncher {
        pub(crate) fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                rng: Mutex::new(StdRng::seed_from_u64(7)),
                launches: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn launch_count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }

        pub(crate) fn alive_for(&self, camera_id: &str) -> usize {
            self.launches.lock().unwrap().iter()
                .filter(|l| l.command.camera_id == camera_id && l.state.lock().unwrap().exit().is_none())
                .count()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, command: &SegmentCommand) -> Result<Box<dyn RecordingProcess>> {
            assert_eq!(self.alive_for(&command.camera_id), 0,
                       "second live process launched for {}", command.camera_id);

            let now = Instant::now();
            let mut state = ProcState { honours_terminate: true, ..Default::default() };
            match self.behavior {
                Behavior::ExitAfter(after, code) => {
                    state.exits_at = Some(now + after);
                    state.code = Some(code);
                }
                Behavior::Stubborn => state.honours_terminate = false,
                Behavior::FailImmediately(code) => {
                    state.exits_at = Some(now);
                    state.code = Some(code);
                }
                Behavior::NotFound => return Err(StreamError::tool_not_found("ffmpeg")),
                Behavior::Random => {
                    let mut rng = self.rng.lock().unwrap();
                    state.exits_at = Some(now + Duration::from_millis(rng.gen_range(0..8_000)));
                    state.code = Some(if rng.gen_bool(0.7) { 0 } else { 1 });
                    state.honours_terminate = rng.gen_bool(0.8);
                }
                Behavior::Unpollable => state.unpollable = true,
            }

            let state = Arc::new(Mutex::new(state));
            self.launches.lock().unwrap().push(Launch { command: command.clone(), state: state.clone() });
            Ok(Box::new(FakeProcess { state }))
        }
    }

    struct FakeProcess {
        state: Arc<Mutex<ProcState>>,
    }

    #[async_trait]
    impl RecordingProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_wait(&mut self) -> Result<Option<SegmentExit>> {
            let state = self.state.lock().unwrap();
            if state.unpollable && !state.killed {
                return Err(StreamError::ffmpeg("waitpid failed"));
            }
            Ok(state.exit())
        }

        fn terminate(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.terminated = true;
            if state.honours_terminate && state.exit().is_none() {
                state.exits_at = Some(Instant::now());
                state.code = Some(255);
            }
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.killed = true;
            if state.unpollable {
                return Err(StreamError::ffmpeg("no such process group"));
            }
            Ok(())
        }

        async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<SegmentExit>> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(exit) = self.try_wait()? {
                    return Ok(Some(exit));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        async fn error_output(&mut self) -> String {
            "rtsp://cam: Connection refused".to_string()
        }
    }

    pub(crate) fn camera(id: &str, enabled: bool) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: format!("Camera {}", id),
            url: format!("rtsp://10.0.0.1/{}", id),
            enabled,
        }
    }

    pub(crate) fn recording_config(segment_secs: u64, grace_secs: u64) -> RecordingConfig {
        RecordingConfig {
            directory: PathBuf::from("/recordings"),
            segment_duration_secs: segment_secs,
            reconnect_delay_secs: 1,
            startup_grace_secs: grace_secs,
            ..RecordingConfig::default()
        }
    }

    fn supervisor(config: RecordingConfig, launcher: Arc<FakeLauncher>) -> RecordingSupervisor {
        RecordingSupervisor::new(config, launcher, Arc::new(TokioClock::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_chain_back_to_back() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::ExitAfter(Duration::from_secs(5), 0)));
        let mut sup = supervisor(recording_config(5, 0), launcher.clone());
        let cameras = vec![camera("cam1", true)];

        sup.start_segment(&cameras[0]).await;
        let ticks = 23u64;
        for _ in 0..ticks {
            sleep(Duration::from_secs(1)).await;
            sup.reconcile(&cameras).await;
        }

        assert_eq!(launcher.launch_count() as u64, ticks / 5 + 1);
        let launches = launcher.launches.lock().unwrap();
        let mut outputs: Vec<_> = launches.iter().map(|l| l.command.output.clone()).collect();
        outputs.sort();
        outputs.dedup();
        assert_eq!(outputs.len(), launches.len());
        assert!(outputs.iter().all(|p| {
            let name = p.file_name().unwrap().to_string_lossy();
            p.starts_with("/recordings") && name.starts_with("cam1_") && name.ends_with(".mp4")
        }));
        assert_eq!(launches[0].command.duration, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_failure_is_not_registered_and_retried() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::FailImmediately(1)));
        let mut sup = supervisor(recording_config(60, 2), launcher.clone());
        let cameras = vec![camera("cam1", true)];

        let started = Instant::now();
        sup.start_segment(&cameras[0]).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!sup.state("cam1").unwrap().is_running());
        assert_eq!(sup.active_count(), 0);

        sup.reconcile(&cameras).await;
        assert_eq!(launcher.launch_count(), 2);
        assert!(!sup.state("cam1").unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_tool_skips_camera_until_next_reconcile() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::NotFound));
        let mut sup = supervisor(recording_config(60, 2), launcher.clone());
        let cameras = vec![camera("cam1", true), camera("cam2", true)];

        sup.reconcile(&cameras).await;
        sup.reconcile(&cameras).await;
        assert_eq!(sup.active_count(), 0);
        assert!(matches!(sup.state("cam2"), Some(SegmentState::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpollable_process_is_killed_and_not_registered() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::Unpollable));
        let mut sup = supervisor(recording_config(60, 1), launcher.clone());
        let cam = camera("cam1", true);

        sup.start_segment(&cam).await;
        assert!(matches!(sup.state("cam1"), Some(SegmentState::NotStarted)));
        assert!(launcher.launches.lock().unwrap()[0].state.lock().unwrap().killed);
        assert_eq!(launcher.alive_for("cam1"), 0);

        sup.reconcile(&[cam]).await;
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_noop() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::ExitAfter(Duration::from_secs(60), 0)));
        let mut sup = supervisor(recording_config(60, 0), launcher.clone());
        let cam = camera("cam1", true);

        sup.start_segment(&cam).await;
        sup.start_segment(&cam).await;
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(sup.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cameras_are_never_recorded() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::ExitAfter(Duration::from_secs(60), 0)));
        let mut sup = supervisor(recording_config(60, 0), launcher.clone());
        let cameras = vec![camera("cam1", false), camera("cam2", true)];

        sup.reconcile(&cameras).await;
        assert_eq!(launcher.launch_count(), 1);
        assert!(sup.state("cam1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_segment_terminates_gracefully() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::ExitAfter(Duration::from_secs(300), 0)));
        let mut sup = supervisor(recording_config(300, 0), launcher.clone());
        sup.start_segment(&camera("cam1", true)).await;

        let started = Instant::now();
        sup.stop_segment("cam1").await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sup.state("cam1").is_none());

        let launches = launcher.launches.lock().unwrap();
        let state = launches[0].state.lock().unwrap();
        assert!(state.terminated);
        assert!(!state.killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::Stubborn));
        let mut sup = supervisor(recording_config(300, 0), launcher.clone());
        sup.start_segment(&camera("cam1", true)).await;
        sup.start_segment(&camera("cam2", true)).await;

        let started = Instant::now();
        sup.stop_all().await;
        let elapsed = started.elapsed();
        // Both cameras wait out the terminate timeout concurrently.
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(12));
        assert_eq!(sup.active_count(), 0);

        let launches = launcher.launches.lock().unwrap();
        assert!(launches.iter().all(|l| {
            let state = l.state.lock().unwrap();
            state.terminated && state.killed
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_live_processes_per_camera() {
        let launcher = Arc::new(FakeLauncher::new(Behavior::Random));
        let mut sup = supervisor(recording_config(5, 1), launcher.clone());
        let cameras = vec![camera("a", true), camera("b", true), camera("c", true)];
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            sleep(Duration::from_millis(rng.gen_range(0..3_000))).await;
            match rng.gen_range(0..10) {
                0 => sup.stop_segment(&cameras[rng.gen_range(0..3)].id).await,
                1 => sup.start_segment(&cameras[rng.gen_range(0..3)]).await,
                _ => sup.reconcile(&cameras).await,
            }
            for cam in &cameras {
                assert!(launcher.alive_for(&cam.id) <= 1);
            }
        }
        assert!(launcher.launch_count() > 3);
        sup.stop_all().await;
        for cam in &cameras {
            assert_eq!(launcher.alive_for(&cam.id), 0);
        }
    }
}
