pub mod notifier;

use crate::queue::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Immutable copy of a job's observable state, taken at read time.
///
/// Observers only ever see whole snapshots, never a live reference into the
/// queue, so a concurrent worker write cannot tear a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(status: JobStatus, percent: u8) -> Self {
        Self {
            status,
            percent,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            percent: 0,
            error_message: Some(message.into()),
        }
    }
}

impl From<&Job> for ProgressSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            percent: job.percent,
            error_message: job.error_message.clone(),
        }
    }
}

/// Shared progress state, one cell per active job.
///
/// Each cell is a `tokio::sync::watch` channel: the worker is the only
/// writer, any number of observers read (or subscribe to) the latest value.
/// A write is immediately visible to subsequent reads; a finished job's
/// final snapshot stays readable until `clear`.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    cells: Mutex<HashMap<Uuid, watch::Sender<ProgressSnapshot>>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot for a job. Worker-only.
    pub fn set(&self, job_id: Uuid, snapshot: ProgressSnapshot) {
        let mut cells = self.cells.lock().unwrap();
        match cells.get(&job_id) {
            Some(tx) => {
                // send_replace keeps the value even with no subscribers.
                tx.send_replace(snapshot);
            }
            None => {
                let (tx, _rx) = watch::channel(snapshot);
                cells.insert(job_id, tx);
            }
        }
    }

    /// Latest snapshot for a job, if one has been published.
    pub fn get(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        let cells = self.cells.lock().unwrap();
        cells.get(&job_id).map(|tx| tx.borrow().clone())
    }

    /// Subscribe to a job's cell for change-driven reads.
    pub fn subscribe(&self, job_id: Uuid) -> Option<watch::Receiver<ProgressSnapshot>> {
        let cells = self.cells.lock().unwrap();
        cells.get(&job_id).map(|tx| tx.subscribe())
    }

    /// Drop a finished job's cell.
    pub fn clear(&self, job_id: Uuid) {
        self.cells.lock().unwrap().remove(&job_id);
    }
}
