use crate::engine::TranscriptionEngine;
use crate::progress::{ProgressBoard, ProgressSnapshot};
use crate::queue::{Job, JobQueue};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the background worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory where result artifacts are written.
    pub transcripts_dir: PathBuf,
    /// How often the drain loop checks for new jobs.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(transcripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            transcripts_dir: transcripts_dir.into(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// The single background execution unit.
///
/// Drains the job queue strictly in order, one job at a time; the engine
/// call blocks, so each job is processed on a blocking task while this loop
/// stays responsive to shutdown. Skip and cancel requests are observed at
/// segment boundaries, never preemptively.
pub struct Worker {
    queue: Arc<JobQueue>,
    board: Arc<ProgressBoard>,
    engine: Arc<dyn TranscriptionEngine>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        board: Arc<ProgressBoard>,
        engine: Arc<dyn TranscriptionEngine>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            board,
            engine,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Whether the drain loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the drain loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::Relaxed);
        info!("worker started");

        let queue = Arc::clone(&self.queue);
        let board = Arc::clone(&self.board);
        let engine = Arc::clone(&self.engine);
        let transcripts_dir = self.config.transcripts_dir.clone();
        let running = Arc::clone(&self.running);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = self.config.poll_interval;

        tokio::spawn(async move {
            let mut interval = interval(poll_interval);
            let mut last_job: Option<Uuid> = None;

            while running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {}
                }

                // Drain everything currently queued before sleeping again.
                while running.load(Ordering::Relaxed) {
                    let Some(job) = queue.current() else { break };
                    // A finished job's snapshot stays readable until the
                    // next job starts.
                    if let Some(prev) = last_job.replace(job.id) {
                        board.clear(prev);
                    }
                    let result = tokio::task::spawn_blocking({
                        let queue = Arc::clone(&queue);
                        let board = Arc::clone(&board);
                        let engine = Arc::clone(&engine);
                        let dir = transcripts_dir.clone();
                        let job = job.clone();
                        move || process_job(&queue, &board, engine.as_ref(), &dir, &job)
                    })
                    .await;
                    if let Err(e) = result {
                        // The job must still reach a terminal status or the
                        // cursor never advances past it.
                        error!(job_id = %job.id, error = %e, "job processing task panicked");
                        fail_job(&queue, &board, job.id, "job processing panicked".to_string());
                    }
                }
            }

            info!("worker drain loop ended");
        })
    }

    /// Signal the drain loop to stop after the current job.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!("worker stopping");
            let _ = self.shutdown_tx.send(());
        }
    }
}

/// Publish a job's current queue state to the progress board.
fn publish(queue: &JobQueue, board: &ProgressBoard, job_id: Uuid) {
    if let Some(job) = queue.get(job_id) {
        board.set(job_id, ProgressSnapshot::from(&job));
    }
}

/// Mark a job failed (unless a skip/cancel already ended it) and publish.
fn fail_job(queue: &JobQueue, board: &ProgressBoard, job_id: Uuid, message: String) {
    if queue.fail(job_id, message.as_str()) {
        warn!(job_id = %job_id, message, "job failed");
    }
    publish(queue, board, job_id);
}

/// True when an external skip/cancel has ended the job; publishes the
/// terminal snapshot so observers see it.
fn interrupted(queue: &JobQueue, board: &ProgressBoard, job_id: Uuid) -> bool {
    match queue.status_of(job_id) {
        Some(status) if status.is_terminal() => {
            info!(job_id = %job_id, ?status, "job interrupted externally");
            publish(queue, board, job_id);
            true
        }
        _ => false,
    }
}

/// Process one job start to finish. Blocking; runs off the async loop.
///
/// The artifact is only valid once fully written and flushed; an
/// interruption mid-stream leaves a partial file in place but the job is
/// never reported `Completed`. The source file is removed if and only if
/// the job completes.
fn process_job(
    queue: &JobQueue,
    board: &ProgressBoard,
    engine: &dyn TranscriptionEngine,
    transcripts_dir: &Path,
    job: &Job,
) {
    let job_id = job.id;
    if !queue.begin(job_id) {
        // Skipped or cancelled while still queued.
        publish(queue, board, job_id);
        return;
    }
    info!(job_id = %job_id, source = %job.source_path.display(), "job started");
    publish(queue, board, job_id);

    let output = match engine.transcribe(&job.source_path) {
        Ok(output) => output,
        Err(e) => return fail_job(queue, board, job_id, e.to_string()),
    };

    queue.mark_transcribing(job_id);
    publish(queue, board, job_id);

    let artifact_path = artifact_path(transcripts_dir, &job.source_path);
    let file = match std::fs::File::create(&artifact_path) {
        Ok(file) => file,
        Err(e) => return fail_job(queue, board, job_id, e.to_string()),
    };
    let mut writer = BufWriter::new(file);

    let duration = output.duration;
    let mut segments_written = 0u64;

    for segment in output.segments {
        if interrupted(queue, board, job_id) {
            return;
        }
        let segment = match segment {
            Ok(segment) => segment,
            Err(e) => {
                let _ = writer.flush();
                return fail_job(queue, board, job_id, e.to_string());
            }
        };
        if let Err(e) = writeln!(
            writer,
            "[{:.2}s -> {:.2}s] {}",
            segment.start, segment.end, segment.text
        ) {
            return fail_job(queue, board, job_id, e.to_string());
        }
        segments_written += 1;

        let percent = if duration > 0.0 {
            ((segment.end / duration) * 100.0).floor() as u8
        } else {
            100
        };
        queue.set_percent(job_id, percent.min(100));
        publish(queue, board, job_id);
        debug!(job_id = %job_id, segments = segments_written, percent, "segment written");

        if interrupted(queue, board, job_id) {
            return;
        }
    }

    if segments_written == 0 {
        return fail_job(
            queue,
            board,
            job_id,
            "no segments were transcribed".to_string(),
        );
    }

    if let Err(e) = writer.flush() {
        return fail_job(queue, board, job_id, e.to_string());
    }
    if let Err(e) = writer.get_ref().sync_all() {
        return fail_job(queue, board, job_id, e.to_string());
    }
    drop(writer);

    if queue.complete(job_id) {
        publish(queue, board, job_id);
        info!(job_id = %job_id, artifact = %artifact_path.display(), "job completed");
        // Keep the source only for diagnosis on failure paths.
        if let Err(e) = std::fs::remove_file(&job.source_path) {
            warn!(source = %job.source_path.display(), error = %e, "failed to remove source file");
        }
    } else {
        // A skip or cancel landed between the last segment and completion.
        publish(queue, board, job_id);
    }
}

/// `<transcripts>/<source stem>.txt`
fn artifact_path(transcripts_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transcript".to_string());
    transcripts_dir.join(format!("{stem}.txt"))
}
