use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::errors::{Result, StreamError};
use crate::utils::redact_url;

/// Opens live connections to camera streams.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn CaptureHandle>>;
}

/// One open camera connection.
#[async_trait]
pub trait CaptureHandle: Send {
    /// `Ok(None)` is a read failure: the stream ended or stalled.
    /// `Err` is reserved for unexpected faults of the handle itself.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;

    /// Close the connection. Called at most once per handle.
    async fn release(&mut self);
}

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_SIZE: usize = 8192;

/// Reads RTSP streams through an `ffmpeg` child that re-encodes to MJPEG on stdout.
pub struct FfmpegCapture {
    ffmpeg_path: String,
    quality: u8,
}

impl FfmpegCapture {
    pub fn new(ffmpeg_path: impl Into<String>, quality: u8) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            quality: quality.clamp(2, 31),
        }
    }

    fn build_args(&self, url: &str) -> Vec<String> {
        let quality = self.quality.to_string();
        let args = [
            "-rtsp_transport", "tcp",
            "-fflags", "+nobuffer+discardcorrupt",  // Smallest possible input buffering
            "-flags", "low_delay",
            "-probesize", "32",
            "-analyzeduration", "0",
            "-i", url,
            "-f", "mjpeg",
            "-q:v", &quality,
            "-an",
            "-loglevel", "error",
            "-",
        ];
        args.iter().map(|s| s.to_string()).collect()
    }
}

#[async_trait]
impl CaptureSource for FfmpegCapture {
    async fn open(&self, url: &str) -> Result<Box<dyn CaptureHandle>> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.build_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StreamError::tool_not_found(&self.ffmpeg_path)
                } else {
                    StreamError::from(e)
                }
            })?;

        let stdout = child.stdout.take()
            .ok_or_else(|| StreamError::capture("Failed to get FFmpeg stdout"))?;

        let mut handle = FfmpegCaptureHandle {
            child: Some(child),
            stdout,
            splitter: MjpegSplitter::new(),
            pending: None,
        };

        // The connection only counts as open once the camera delivered a frame.
        let first = tokio::time::timeout(OPEN_TIMEOUT, handle.next_jpeg()).await;
        match first {
            Ok(Ok(Some(first))) => {
                debug!("First frame received from {}", redact_url(url));
                handle.pending = Some(first);
                Ok(Box::new(handle))
            }
            Ok(Ok(None)) => {
                handle.release().await;
                Err(StreamError::capture("stream closed before the first frame"))
            }
            Ok(Err(e)) => {
                handle.release().await;
                Err(e)
            }
            Err(_) => {
                handle.release().await;
                Err(StreamError::capture(format!("no frame within {}s", OPEN_TIMEOUT.as_secs())))
            }
        }
    }
}

struct FfmpegCaptureHandle {
    child: Option<Child>,
    stdout: ChildStdout,
    splitter: MjpegSplitter,
    pending: Option<Bytes>,
}

impl FfmpegCaptureHandle {
    async fn next_jpeg(&mut self) -> Result<Option<Bytes>> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Ok(Some(frame));
            }
            let n = self.stdout.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.splitter.push(&chunk[..n]);
        }
    }
}

#[async_trait]
impl CaptureHandle for FfmpegCaptureHandle {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match tokio::time::timeout(READ_TIMEOUT, self.next_jpeg()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No frame from FFmpeg within {}s", READ_TIMEOUT.as_secs());
                Ok(None)
            }
        }
    }

    async fn release(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!("FFmpeg capture process already gone: {}", e);
        }
        match tokio::time::timeout(RELEASE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!("FFmpeg capture process exited ({})", status),
            Ok(Err(e)) => warn!("Failed to reap FFmpeg capture process: {}", e),
            Err(_) => warn!("FFmpeg capture process did not exit within {}s", RELEASE_TIMEOUT.as_secs()),
        }
    }
}

/// Splits a concatenated MJPEG byte stream into complete JPEG images.
///
/// Bytes before a start-of-image marker are discarded; bytes after an
/// end-of-image marker are kept for the next frame.
pub struct MjpegSplitter {
    buffer: BytesMut,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(100_000) }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = match find_marker(&self.buffer, 0, 0xD8) {
            Some(start) => start,
            None => {
                // Keep a trailing 0xFF, it may be the first half of a marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop_len = self.buffer.len() - keep;
                let _ = self.buffer.split_to(drop_len);
                return None;
            }
        };
        let _ = self.buffer.split_to(start);

        let end = find_marker(&self.buffer, 2, 0xD9)?;
        Some(self.buffer.split_to(end + 2).freeze())
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8], from: usize, code: u8) -> Option<usize> {
    if buffer.len() < 2 || from > buffer.len() - 2 {
        return None;
    }
    (from..buffer.len() - 1).find(|&i| buffer[i] == 0xFF && buffer[i + 1] == code)
}
