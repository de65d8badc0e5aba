use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{Result, StreamError};
use crate::recording::{ProcessLauncher, RecordingProcess, SegmentCommand, SegmentExit};

/// Lines of stderr kept per process for failure diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Launches one `ffmpeg` process per recording segment.
pub struct FfmpegLauncher {
    ffmpeg_path: String,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into() }
    }

    pub fn build_args(command: &SegmentCommand) -> Vec<String> {
        let duration = command.duration.as_secs().to_string();
        let output = command.output.to_string_lossy();
        let args = [
            "-rtsp_transport", "tcp",  // TCP for a stable input stream
            "-i", &command.url,
            "-c:v", "copy",            // Video is stored as received
            "-c:a", "aac",
            "-t", &duration,
            "-loglevel", "error",
            "-y",
            &output,
        ];
        args.iter().map(|s| s.to_string()).collect()
    }
}

impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, command: &SegmentCommand) -> Result<Box<dyn RecordingProcess>> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(Self::build_args(command));
        let process = FfmpegProcess::spawn(cmd, &self.ffmpeg_path)?;
        debug!(camera = %command.camera_id, "Spawned FFmpeg with PID {:?}", process.pid);
        Ok(Box::new(process))
    }
}

/// A transcoder child running in its own process group.
pub struct FfmpegProcess {
    child: Child,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    pub fn spawn(mut command: Command, tool: &str) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StreamError::tool_not_found(tool)
            } else {
                StreamError::from(e)
            }
        })?;

        // Drain stderr continuously so a chatty process never blocks on a full pipe.
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        Ok(Self {
            pid: child.id(),
            child,
            stderr_tail,
            stderr_task,
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = self.pid.ok_or_else(|| StreamError::ffmpeg("process id unavailable"))?;
        killpg(Pid::from_raw(pid as i32), signal)
            .map_err(|e| StreamError::ffmpeg(format!("failed to send {} to process group {}: {}", signal, pid, e)))
    }
}

#[async_trait]
impl RecordingProcess for FfmpegProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<SegmentExit>> {
        Ok(self.child.try_wait()?.map(|status| SegmentExit { code: status.code() }))
    }

    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            Ok(self.child.start_kill()?)
        }
    }

    fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Err(e) = self.signal_group(nix::sys::signal::Signal::SIGKILL) {
                debug!("{}", e);
            }
        }
        Ok(self.child.start_kill()?)
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<SegmentExit>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(SegmentExit { code: status?.code() })),
            Err(_) => Ok(None),
        }
    }

    async fn error_output(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            // The pipe closes when the process exits; don't wait on a live one.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        let tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
