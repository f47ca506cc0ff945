use super::{ProgressBoard, ProgressSnapshot};
use crate::queue::JobStatus;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration for a notifier loop.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// How often to poll the progress cell.
    pub poll_interval: Duration,
    /// Maximum number of polls before giving up with a synthetic timeout.
    pub max_attempts: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        // 300 polls at 1s: a five-minute ceiling per observer.
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 300,
        }
    }
}

/// One event pushed to an observer.
///
/// Serializes to `{"status": ..., "percent": ...}` for ordinary updates and
/// `{"status": "error", "message": ...}` for failures, matching the upload
/// protocol's event-stream payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Status { status: JobStatus, percent: u8 },
    Error { status: JobStatus, message: String },
}

impl ProgressEvent {
    fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        match snapshot.status {
            JobStatus::Error => ProgressEvent::Error {
                status: JobStatus::Error,
                message: snapshot
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Transcription failed".to_string()),
            },
            status => ProgressEvent::Status {
                status,
                percent: snapshot.percent,
            },
        }
    }

    fn timeout() -> Self {
        ProgressEvent::Error {
            status: JobStatus::Error,
            message: "Timeout".to_string(),
        }
    }

    /// Status carried by this event.
    pub fn status(&self) -> JobStatus {
        match self {
            ProgressEvent::Status { status, .. } => *status,
            ProgressEvent::Error { status, .. } => *status,
        }
    }
}

/// Change-driven progress emitter for one observer watching one job.
///
/// Polls the job's progress cell on a fixed cadence and forwards an event
/// only when the status differs from the last one sent, except that
/// `Completed` and `Error` are always (re-)emitted once before the loop
/// ends. If the attempt ceiling is reached without a terminal status, a
/// single synthetic `Timeout` error event is emitted instead. Dropping the
/// receiver simply ends the loop; job and worker state are unaffected.
pub struct ProgressNotifier {
    board: Arc<ProgressBoard>,
    job_id: Uuid,
    config: NotifierConfig,
}

impl ProgressNotifier {
    pub fn new(board: Arc<ProgressBoard>, job_id: Uuid) -> Self {
        Self::with_config(board, job_id, NotifierConfig::default())
    }

    pub fn with_config(board: Arc<ProgressBoard>, job_id: Uuid, config: NotifierConfig) -> Self {
        Self {
            board,
            job_id,
            config,
        }
    }

    /// Spawn the poll loop and hand back the observer's end of the stream.
    pub fn subscribe(self) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(tx));
        rx
    }

    /// Poll loop body. Public for direct driving in tests.
    pub async fn run(self, events: mpsc::Sender<ProgressEvent>) {
        let mut last_emitted: Option<JobStatus> = None;

        for _ in 0..self.config.max_attempts {
            // A job with no cell yet has not been touched by the worker.
            let snapshot = self
                .board
                .get(self.job_id)
                .unwrap_or_else(|| ProgressSnapshot::new(JobStatus::Queued, 0));
            let status = snapshot.status;

            let terminal_for_protocol =
                matches!(status, JobStatus::Completed | JobStatus::Error);

            if last_emitted != Some(status) || terminal_for_protocol {
                let event = ProgressEvent::from_snapshot(&snapshot);
                debug!(job_id = %self.job_id, ?status, "progress event");
                if events.send(event).await.is_err() {
                    // Observer went away; nothing left to notify.
                    return;
                }
                last_emitted = Some(status);
            }

            if terminal_for_protocol {
                return;
            }

            sleep(self.config.poll_interval).await;
        }

        warn!(job_id = %self.job_id, "observer poll ceiling reached");
        let _ = events.send(ProgressEvent::timeout()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_config(max_attempts: u32) -> NotifierConfig {
        NotifierConfig {
            poll_interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn emits_once_per_status_and_ends_on_completed() {
        let board = Arc::new(ProgressBoard::new());
        let id = Uuid::new_v4();
        board.set(id, ProgressSnapshot::new(JobStatus::Processing, 0));

        let notifier = ProgressNotifier::with_config(Arc::clone(&board), id, fast_config(100));
        let rx = notifier.subscribe();

        let writer = tokio::spawn({
            let board = Arc::clone(&board);
            async move {
                sleep(Duration::from_millis(20)).await;
                board.set(id, ProgressSnapshot::new(JobStatus::Transcribing, 50));
                sleep(Duration::from_millis(20)).await;
                board.set(id, ProgressSnapshot::new(JobStatus::Completed, 100));
            }
        });

        let events = collect(rx).await;
        writer.await.unwrap();

        let statuses: Vec<JobStatus> = events.iter().map(|e| e.status()).collect();
        // Processing and Transcribing appear exactly once despite repeated
        // polls of an unchanged status; Completed ends the stream.
        assert_eq!(
            statuses,
            vec![
                JobStatus::Processing,
                JobStatus::Transcribing,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn error_event_carries_message_and_ends_stream() {
        let board = Arc::new(ProgressBoard::new());
        let id = Uuid::new_v4();
        board.set(id, ProgressSnapshot::error("engine exploded"));

        let notifier = ProgressNotifier::with_config(board, id, fast_config(100));
        let events = collect(notifier.subscribe()).await;

        assert_eq!(
            events,
            vec![ProgressEvent::Error {
                status: JobStatus::Error,
                message: "engine exploded".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn unchanged_job_times_out_with_single_synthetic_error() {
        let board = Arc::new(ProgressBoard::new());
        let id = Uuid::new_v4();
        board.set(id, ProgressSnapshot::new(JobStatus::Processing, 10));

        let notifier = ProgressNotifier::with_config(board, id, fast_config(10));
        let events = collect(notifier.subscribe()).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status(), JobStatus::Processing);
        assert_eq!(
            events[1],
            ProgressEvent::Error {
                status: JobStatus::Error,
                message: "Timeout".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_cell_reads_as_queued() {
        let board = Arc::new(ProgressBoard::new());
        let notifier =
            ProgressNotifier::with_config(board, Uuid::new_v4(), fast_config(3));
        let events = collect(notifier.subscribe()).await;

        assert_eq!(events[0].status(), JobStatus::Queued);
        assert_eq!(events.last().unwrap().status(), JobStatus::Error); // timeout
    }

    #[test]
    fn event_json_shapes() {
        let status = ProgressEvent::Status {
            status: JobStatus::Transcribing,
            percent: 42,
        };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"status":"transcribing","percent":42}"#
        );

        let error = ProgressEvent::timeout();
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"status":"error","message":"Timeout"}"#
        );
    }
}
