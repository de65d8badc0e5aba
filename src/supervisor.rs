use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureSource;
use crate::config::{CameraConfig, Config};
use crate::frame_cache::{CameraFeed, FrameRegistry, StreamState};
use crate::recording::{ProcessLauncher, RecordingSupervisor, SegmentState};
use crate::utils::Clock;
use crate::video_stream::CameraStreamWorker;

/// Wall-clock cadence of the status line, in seconds.
const STATUS_PERIOD_SECS: i64 = 300;

/// Owns every stream worker and the recording supervisor, drives the
/// reconcile ticks and tears everything down on shutdown.
pub struct Supervisor {
    cameras: Vec<CameraConfig>,
    workers: Vec<CameraStreamWorker>,
    recordings: Option<RecordingSupervisor>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    reconcile_interval: Duration,
    last_status_bucket: Option<i64>,
    stopped: bool,
}

impl Supervisor {
    /// Build workers for enabled cameras only. `capture` enables live preview,
    /// `launcher` enables recording.
    pub fn new(
        config: &Config,
        capture: Option<Arc<dyn CaptureSource>>,
        launcher: Option<Arc<dyn ProcessLauncher>>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let cameras = config.enabled_cameras();
        for camera in config.cameras.iter().filter(|c| !c.enabled) {
            info!(camera = %camera.id, "Camera {} is disabled, skipping", camera.name);
        }

        let workers = match capture {
            Some(source) => cameras
                .iter()
                .map(|camera| CameraStreamWorker::new(camera.clone(), source.clone(), shutdown.clone()))
                .collect(),
            None => Vec::new(),
        };

        let recordings = launcher.map(|launcher| {
            RecordingSupervisor::new(config.recording.clone(), launcher, clock.clone())
        });

        Self {
            cameras,
            workers,
            recordings,
            clock,
            shutdown,
            reconcile_interval: config.recording.reconcile_interval(),
            last_status_bucket: None,
            stopped: false,
        }
    }

    /// Frame cache read API handed to the preview layer.
    pub fn frame_registry(&self) -> FrameRegistry {
        FrameRegistry::new(
            self.workers
                .iter()
                .map(|worker| CameraFeed {
                    id: worker.camera().id.clone(),
                    name: worker.camera().name.clone(),
                    cache: worker.cache(),
                })
                .collect(),
        )
    }

    pub async fn start(&mut self) {
        for worker in &mut self.workers {
            worker.start();
        }
        if let Some(recordings) = self.recordings.as_mut() {
            for camera in &self.cameras {
                recordings.start_segment(camera).await;
            }
        }
        self.log_status();
    }

    /// Run until the shutdown token is cancelled, then stop everything.
    pub async fn run(mut self) {
        self.start().await;
        info!("Supervisor running with {} cameras, reconcile every {}s",
              self.cameras.len(), self.reconcile_interval.as_secs());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.reconcile_interval) => {}
            }
            self.tick().await;
        }

        self.shutdown().await;
    }

    pub async fn tick(&mut self) {
        if let Some(recordings) = self.recordings.as_mut() {
            recordings.reconcile(&self.cameras).await;
        }
        if self.status_due() {
            self.log_status();
        }
    }

    fn status_due(&mut self) -> bool {
        let bucket = self.clock.now().timestamp().div_euclid(STATUS_PERIOD_SECS);
        if self.last_status_bucket == Some(bucket) {
            return false;
        }
        self.last_status_bucket = Some(bucket);
        true
    }

    fn log_status(&mut self) {
        let streaming = self.workers
            .iter()
            .filter(|w| w.cache().state() == StreamState::Streaming)
            .count();
        let recording = self.recordings.as_mut().map_or(0, |r| r.active_count());
        if let Some(recordings) = self.recordings.as_ref() {
            for camera in &self.cameras {
                if !recordings.state(&camera.id).is_some_and(SegmentState::is_running) {
                    debug!(camera = %camera.id, "No active recording for {}", camera.name);
                }
            }
        }
        info!("Status: {}/{} streams connected, {} recordings active - {}",
              streaming, self.workers.len(), recording, self.clock.now().format("%H:%M:%S"));
    }

    /// Stop every worker and recording. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        info!("Shutting down {} stream workers", self.workers.len());

        join_all(self.workers.iter_mut().map(|worker| worker.stop())).await;

        if let Some(recordings) = self.recordings.as_mut() {
            info!("Stopping all recordings");
            recordings.stop_all().await;
        }

        if self.workers.iter().any(|w| w.is_running()) {
            warn!("Some stream workers did not exit cleanly");
        }
        info!("Supervisor stopped");
    }
}
