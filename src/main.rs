use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapescribe::{
    api::StorageConfig,
    engine::{SubprocessEngine, SubprocessEngineConfig},
    progress::ProgressBoard,
    queue::JobQueue,
    worker::{Worker, WorkerConfig},
};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tapescribe")]
#[command(about = "A chunked-upload transcription job service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Inbox directory for assembled and whole uploads
    #[arg(long, default_value = "uploads")]
    pub inbox: PathBuf,

    /// Staging directory for in-flight chunk sessions
    #[arg(long, default_value = "chunks")]
    pub staging: PathBuf,

    /// Output directory for transcript artifacts
    #[arg(long, default_value = "transcripts")]
    pub transcripts: PathBuf,

    /// Engine command to run per job (source path is appended)
    #[arg(long, default_value = "whisper-segments")]
    pub engine_cmd: String,

    /// Extra arguments for the engine command
    #[arg(long, default_value = "")]
    pub engine_args: String,

    /// Working directory for engine processes
    #[arg(long)]
    pub engine_workdir: Option<PathBuf>,

    /// Queue polling interval in milliseconds
    #[arg(long, default_value = "100")]
    pub poll_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Enqueue audio files already sitting in the inbox: uploads that were
/// assembled before a previous shutdown but never transcribed.
async fn recover_inbox(inbox: &PathBuf, queue: &JobQueue) -> Result<usize> {
    let mut recovered = 0;
    let mut dir = tokio::fs::read_dir(inbox)
        .await
        .context("Failed to read inbox directory")?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if tapescribe::upload::validate_extension(&name).is_err() {
            warn!(file = %name, "ignoring non-audio file in inbox");
            continue;
        }
        let job_id = queue.enqueue(&path);
        info!(file = %name, job_id = %job_id, "recovered inbox file");
        recovered += 1;
    }
    Ok(recovered)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting tapescribe v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Inbox: {}", args.inbox.display());
    info!("  Staging: {}", args.staging.display());
    info!("  Transcripts: {}", args.transcripts.display());
    info!("  Engine: {} {}", args.engine_cmd, args.engine_args);
    info!("  Log level: {:?}", args.log_level);

    let storage = StorageConfig {
        inbox: args.inbox.clone(),
        staging: args.staging.clone(),
        transcripts: args.transcripts.clone(),
    };
    storage
        .ensure_dirs()
        .await
        .context("Failed to create storage roots")?;

    let engine_args: Vec<String> = args
        .engine_args
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let engine = Arc::new(SubprocessEngine::new(SubprocessEngineConfig {
        command: args.engine_cmd.clone(),
        args: engine_args,
        working_dir: args.engine_workdir.clone(),
    }));

    let queue = Arc::new(JobQueue::new());
    let board = Arc::new(ProgressBoard::new());
    // Uploads come in through the library's UploadService; a front end
    // embedding this crate shares these handles. The binary itself drains
    // whatever lands in the inbox.

    let recovered = recover_inbox(&args.inbox, &queue)
        .await
        .context("Inbox recovery failed")?;
    if recovered > 0 {
        info!("Recovered {} pending upload(s) from the inbox", recovered);
    }

    let mut worker_config = WorkerConfig::new(&args.transcripts);
    worker_config.poll_interval = Duration::from_millis(args.poll_interval);
    let worker = Worker::new(Arc::clone(&queue), board, engine, worker_config);
    let worker_handle = worker.start();

    info!("tapescribe started");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_term_signal() => {
            info!("Received TERM signal");
        }
    }

    worker.stop();
    if let Err(e) = worker_handle.await {
        error!("Worker task failed to join: {}", e);
    }

    info!("tapescribe stopped");
    Ok(())
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    // On non-Unix systems, just wait indefinitely
    futures::future::pending::<()>().await;
}
