use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod capture;
mod cleaner;
mod config;
mod errors;
mod frame_cache;
mod handlers;
mod recording;
mod supervisor;
mod transcoder;
mod utils;
mod video_stream;

use capture::{CaptureSource, FfmpegCapture};
use cleaner::RetentionCleaner;
use config::Config;
use handlers::PreviewState;
use recording::ProcessLauncher;
use supervisor::Supervisor;
use transcoder::FfmpegLauncher;
use utils::SystemClock;

#[derive(Parser)]
#[command(name = "camera-supervisor", version, about = "Supervises IP camera previews and segmented recordings")]
struct Cli {
    /// Configuration file (TOML, or JSON when the name ends in .json)
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    // Flags for the default `run` when no subcommand is given
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run previews, recorder and cleaner until interrupted (default)
    Run(RunArgs),
    /// Delete recordings older than the retention window, then exit
    Clean {
        /// Report what would be deleted without removing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args, Debug, Default, PartialEq)]
struct RunArgs {
    /// Only run the live previews
    #[arg(long)]
    no_recorder: bool,
    /// Do not capture previews or serve HTTP
    #[arg(long)]
    no_preview: bool,
    #[arg(long)]
    no_cleaner: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("camera_supervisor=debug,info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    match cli.command {
        None => run(config, cli.run).await,
        Some(Commands::Run(args)) => run(config, args).await,
        Some(Commands::Clean { dry_run }) => {
            let report = RetentionCleaner::from_config(&config)?.run(dry_run).await?;
            info!("Removed {} recordings, kept {}", report.deleted, report.kept);
            Ok(())
        }
    }
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if config.enabled_cameras().is_empty() {
        warn!("No enabled cameras configured");
    }

    if !args.no_recorder {
        tokio::fs::create_dir_all(&config.recording.directory)
            .await
            .with_context(|| format!("Failed to create recordings directory {:?}", config.recording.directory))?;
    }

    let capture: Option<Arc<dyn CaptureSource>> = if args.no_preview {
        None
    } else {
        Some(Arc::new(FfmpegCapture::new(config.recording.ffmpeg_path.clone(), config.preview.jpeg_quality)))
    };
    let launcher: Option<Arc<dyn ProcessLauncher>> = if args.no_recorder {
        None
    } else {
        Some(Arc::new(FfmpegLauncher::new(config.recording.ffmpeg_path.clone())))
    };

    let supervisor = Supervisor::new(&config, capture, launcher, Arc::new(SystemClock), shutdown.clone());
    let registry = supervisor.frame_registry();
    let supervisor_task = tokio::spawn(supervisor.run());

    let cleaner_task = if args.no_cleaner {
        None
    } else {
        let cleaner = RetentionCleaner::from_config(&config)?;
        Some(cleaner.spawn_periodic(config.cleaner.interval()?, shutdown.child_token()))
    };

    let mut result = Ok(());
    if !args.no_preview {
        let state = PreviewState::new(
            registry,
            config.cameras.clone(),
            Duration::from_millis(config.preview.frame_interval_ms),
            shutdown.child_token(),
        );
        let addr = format!("{}:{}", config.preview.host, config.preview.port);
        if let Err(e) = serve_preview(state, &addr, shutdown.child_token()).await {
            error!("Preview server failed: {:#}", e);
            shutdown.cancel();
            result = Err(e);
        }
    }

    supervisor_task.await.context("Supervisor task panicked")?;
    if let Some(task) = cleaner_task {
        let _ = task.await;
    }
    info!("System stopped");
    result
}

async fn serve_preview(state: PreviewState, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind preview server on {}", addr))?;
    info!("Preview server listening on http://{}", addr);
    axum::serve(listener, handlers::router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping streams and recordings");
        shutdown.cancel();
        loop {
            wait_for_signal().await;
            warn!("Shutdown already in progress");
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
