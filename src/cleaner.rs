use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::Result;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv"];

#[derive(Debug, Clone)]
pub struct RecordingFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Local>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub to_delete: Vec<RecordingFile>,
    pub to_keep: Vec<RecordingFile>,
    pub skipped: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub kept: usize,
    pub bytes_freed: u64,
    pub errors: usize,
}

/// Deletes recordings whose modification time is older than the retention window.
pub struct RetentionCleaner {
    directory: PathBuf,
    retention: chrono::Duration,
}

impl RetentionCleaner {
    pub fn new(directory: impl Into<PathBuf>, retention: chrono::Duration) -> Self {
        Self { directory: directory.into(), retention }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.recording.directory.clone(), config.cleaner.retention()?))
    }

    pub fn is_video_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Classify every video file in the recordings directory. A missing
    /// directory yields an empty report.
    pub async fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let cutoff = Local::now() - self.retention;

        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Recordings directory {:?} does not exist", self.directory);
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Failed to read metadata of {:?}: {}", path, e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            report.total_bytes += metadata.len();

            if !Self::is_video_file(&path) {
                debug!("Skipping non-video file {:?}", path);
                report.skipped += 1;
                continue;
            }

            let modified = match metadata.modified() {
                Ok(time) => DateTime::<Local>::from(time),
                Err(e) => {
                    warn!("Failed to read modification time of {:?}: {}", path, e);
                    continue;
                }
            };
            let file = RecordingFile { path, size: metadata.len(), modified };
            if modified < cutoff {
                report.to_delete.push(file);
            } else {
                report.to_keep.push(file);
            }
        }

        report.to_delete.sort_by_key(|f| f.modified);
        Ok(report)
    }

    /// Scan and delete expired recordings. With `dry_run` nothing is removed
    /// but the report reflects what would have been.
    pub async fn run(&self, dry_run: bool) -> Result<CleanupReport> {
        let scan = self.scan().await?;
        info!("Retention scan of {:?}: {} expired, {} kept, {} non-video ({:.2} MB total)",
              self.directory, scan.to_delete.len(), scan.to_keep.len(), scan.skipped,
              scan.total_bytes as f64 / (1024.0 * 1024.0));

        let mut report = CleanupReport { kept: scan.to_keep.len(), ..Default::default() };
        for file in scan.to_delete {
            if dry_run {
                info!("Would delete {:?} (modified {})", file.path, file.modified.format("%Y-%m-%d %H:%M:%S"));
                report.deleted += 1;
                report.bytes_freed += file.size;
                continue;
            }
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    debug!("Deleted {:?}", file.path);
                    report.deleted += 1;
                    report.bytes_freed += file.size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{:?} already removed", file.path);
                }
                Err(e) => {
                    warn!("Failed to delete {:?}: {}", file.path, e);
                    report.errors += 1;
                }
            }
        }

        info!("Retention cleanup {}: {} files, {:.2} MB freed, {} errors",
              if dry_run { "(dry run)" } else { "done" },
              report.deleted, report.bytes_freed as f64 / (1024.0 * 1024.0), report.errors);
        Ok(report)
    }

    /// Run cleanup every `interval` until the token is cancelled.
    pub fn spawn_periodic(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retention cleaner started: every {}s, keeping {}h",
                  interval.as_secs(), self.retention.num_hours());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.run(false).await {
                    error!("Retention cleanup failed: {}", e);
                }
            }
            debug!("Retention cleaner stopped");
        })
    }
}
