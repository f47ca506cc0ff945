use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle status of a transcription job.
///
/// Transitions: `Queued -> Processing -> Transcribing -> Completed`,
/// with `Error` reachable from any active state. `Skipped` ends the current
/// job on an explicit skip, whether the worker has picked it up yet or not,
/// and `Cancelled` ends it and everything queued behind it on an explicit
/// cancel. The last four are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue.
    Queued,
    /// Picked up by the worker, engine not yet producing output.
    Processing,
    /// Engine output is streaming in.
    Transcribing,
    /// Artifact fully written, source removed.
    Completed,
    /// Engine or artifact failure; message recorded on the job.
    Error,
    /// Skipped on external request.
    Skipped,
    /// Cancelled on external request.
    Cancelled,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// Whether the worker currently owns the job.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Transcribing)
    }
}

/// One unit of work: an assembled audio file headed for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier for this job.
    pub id: Uuid,
    /// Path to the assembled audio file.
    pub source_path: PathBuf,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Progress through the engine's output, 0..=100.
    pub percent: u8,
    /// Human-readable failure message, set with `JobStatus::Error`.
    pub error_message: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl Job {
    fn new(source_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path,
            status: JobStatus::Queued,
            percent: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: Vec<Job>,
    cursor: usize,
}

impl QueueInner {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    /// Set a terminal status on a job unless it is already terminal, then
    /// advance the cursor if it still points at that job. Returns whether
    /// the status was applied.
    fn finish(&mut self, id: Uuid, status: JobStatus, message: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let Some(idx) = self.position(id) else {
            return false;
        };
        let applied = if self.jobs[idx].status.is_terminal() {
            false
        } else {
            self.jobs[idx].status = status;
            self.jobs[idx].error_message = message;
            if status == JobStatus::Completed {
                self.jobs[idx].percent = 100;
            }
            true
        };
        if self.cursor == idx {
            self.cursor += 1;
        }
        applied
    }
}

/// Ordered collection of pending jobs with a single movable cursor.
///
/// The worker is the only mutator of the job at the cursor; `skip_current`
/// and `cancel_all` may be called from any other context (they only set
/// status flags, which the worker observes at its poll points). Jobs before
/// the cursor are always terminal.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `Queued` job for the given source file, returning its id.
    pub fn enqueue(&self, source_path: impl AsRef<Path>) -> Uuid {
        let job = Job::new(source_path.as_ref().to_path_buf());
        let id = job.id;
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.push(job);
        info!(job_id = %id, queued = inner.jobs.len() - inner.cursor, "job enqueued");
        id
    }

    /// Snapshot of the job at the cursor, if any.
    pub fn current(&self) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(inner.cursor).cloned()
    }

    /// Snapshot of a job by id.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner.position(id).map(|idx| inner.jobs[idx].clone())
    }

    /// Status of a job by id. Cheap poll-point check for the worker.
    pub fn status_of(&self, id: Uuid) -> Option<JobStatus> {
        let inner = self.inner.lock().unwrap();
        inner.position(id).map(|idx| inner.jobs[idx].status)
    }

    /// Number of jobs not yet passed by the cursor.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.jobs.len() - inner.cursor
    }

    /// Mark the current job `Skipped` and advance the cursor.
    ///
    /// Returns the skipped job's id, or `None` if no job is current. The
    /// worker notices the terminal status at its next poll point and
    /// abandons the job's remaining engine output.
    pub fn skip_current(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.jobs.get(inner.cursor).map(|j| j.id)?;
        inner.finish(id, JobStatus::Skipped, None);
        info!(job_id = %id, "job skipped");
        Some(id)
    }

    /// Mark the current job and every remaining `Queued` job `Cancelled`
    /// and drain the queue (cursor moves to the end).
    ///
    /// Returns how many jobs were cancelled; 0 means nothing was active.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut cancelled = 0;
        let cursor = inner.cursor;
        for job in inner.jobs[cursor..].iter_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
                cancelled += 1;
            }
        }
        inner.cursor = inner.jobs.len();
        if cancelled > 0 {
            info!(cancelled, "queue cancelled");
        }
        cancelled
    }

    /// Worker-side: transition a `Queued` job to `Processing` at 0%.
    ///
    /// Returns false if the job is no longer `Queued` (e.g. cancelled while
    /// waiting), in which case the worker must not process it.
    pub fn begin(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.position(id) else {
            return false;
        };
        if inner.jobs[idx].status != JobStatus::Queued {
            return false;
        }
        inner.jobs[idx].status = JobStatus::Processing;
        inner.jobs[idx].percent = 0;
        true
    }

    /// Worker-side: transition `Processing` to `Transcribing` once the
    /// engine has produced output and the total duration is known.
    pub fn mark_transcribing(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.position(id) else {
            return false;
        };
        if inner.jobs[idx].status != JobStatus::Processing {
            return false;
        }
        inner.jobs[idx].status = JobStatus::Transcribing;
        true
    }

    /// Worker-side: update progress. Clamped to `[current, 100]` so percent
    /// never regresses even if the engine emits out-of-order timestamps.
    /// No-op once the job is terminal.
    pub fn set_percent(&self, id: Uuid, percent: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.position(id) else {
            return false;
        };
        if !inner.jobs[idx].status.is_active() {
            return false;
        }
        let clamped = percent.min(100).max(inner.jobs[idx].percent);
        inner.jobs[idx].percent = clamped;
        debug!(job_id = %id, percent = clamped, "progress");
        true
    }

    /// Worker-side: mark the job `Completed` at 100%. No-op if already
    /// terminal (a racing skip/cancel wins).
    pub fn complete(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.finish(id, JobStatus::Completed, None)
    }

    /// Worker-side: mark the job `Error` with a human-readable message.
    /// No-op if already terminal.
    pub fn fail(&self, id: Uuid, message: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.finish(id, JobStatus::Error, Some(message.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(n: usize) -> (JobQueue, Vec<Uuid>) {
        let queue = JobQueue::new();
        let ids = (0..n)
            .map(|i| queue.enqueue(format!("/tmp/audio_{i}.wav")))
            .collect();
        (queue, ids)
    }

    #[test]
    fn enqueue_and_current() {
        let (queue, ids) = queue_with(2);
        let current = queue.current().unwrap();
        assert_eq!(current.id, ids[0]);
        assert_eq!(current.status, JobStatus::Queued);
        assert_eq!(current.percent, 0);
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn complete_advances_cursor() {
        let (queue, ids) = queue_with(2);
        assert!(queue.begin(ids[0]));
        assert!(queue.complete(ids[0]));
        let job = queue.get(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.percent, 100);
        assert_eq!(queue.current().unwrap().id, ids[1]);
    }

    #[test]
    fn skip_current_marks_skipped_and_advances() {
        let (queue, ids) = queue_with(2);
        queue.begin(ids[0]);
        queue.mark_transcribing(ids[0]);
        queue.set_percent(ids[0], 40);

        assert_eq!(queue.skip_current(), Some(ids[0]));
        assert_eq!(queue.get(ids[0]).unwrap().status, JobStatus::Skipped);
        assert_eq!(queue.current().unwrap().id, ids[1]);
        assert_eq!(queue.current().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn skip_applies_to_a_job_the_worker_has_not_picked_up() {
        let (queue, ids) = queue_with(2);
        assert_eq!(queue.skip_current(), Some(ids[0]));
        assert_eq!(queue.get(ids[0]).unwrap().status, JobStatus::Skipped);
        // The worker refuses the skipped job and moves to the next one.
        assert!(!queue.begin(ids[0]));
        assert_eq!(queue.current().unwrap().id, ids[1]);
    }

    #[test]
    fn skip_with_empty_queue_is_noop() {
        let queue = JobQueue::new();
        assert_eq!(queue.skip_current(), None);
        assert_eq!(queue.cancel_all(), 0);
    }

    #[test]
    fn cancel_all_drains_queue() {
        let (queue, ids) = queue_with(3);
        queue.begin(ids[0]);

        assert_eq!(queue.cancel_all(), 3);
        for id in &ids {
            assert_eq!(queue.get(*id).unwrap().status, JobStatus::Cancelled);
        }
        assert!(queue.current().is_none());
        assert_eq!(queue.pending(), 0);

        // Worker-side transitions lose the race against the cancel.
        assert!(!queue.complete(ids[0]));
        assert_eq!(queue.get(ids[0]).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn cancel_does_not_touch_prior_terminal_jobs() {
        let (queue, ids) = queue_with(2);
        queue.begin(ids[0]);
        queue.complete(ids[0]);
        queue.cancel_all();
        assert_eq!(queue.get(ids[0]).unwrap().status, JobStatus::Completed);
        assert_eq!(queue.get(ids[1]).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn percent_is_monotone_and_bounded() {
        let (queue, ids) = queue_with(1);
        queue.begin(ids[0]);
        queue.mark_transcribing(ids[0]);

        queue.set_percent(ids[0], 50);
        assert_eq!(queue.get(ids[0]).unwrap().percent, 50);
        // A lower value does not regress.
        queue.set_percent(ids[0], 30);
        assert_eq!(queue.get(ids[0]).unwrap().percent, 50);
        queue.set_percent(ids[0], 200);
        assert_eq!(queue.get(ids[0]).unwrap().percent, 100);
    }

    #[test]
    fn begin_refuses_terminal_job() {
        let (queue, ids) = queue_with(1);
        queue.cancel_all();
        assert!(!queue.begin(ids[0]));
    }

    #[test]
    fn error_keeps_message() {
        let (queue, ids) = queue_with(1);
        queue.begin(ids[0]);
        queue.fail(ids[0], "no segments were transcribed");
        let job = queue.get(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error_message.as_deref(),
            Some("no segments were transcribed")
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Transcribing).unwrap();
        assert_eq!(json, "\"transcribing\"");
    }
}
