//! Tapescribe - a chunked-upload transcription job service
//!
//! This crate reassembles large audio files delivered in chunks over an
//! unreliable channel and runs them, one at a time, through an external
//! blocking transcription engine while exposing live progress to any number
//! of observers. It features:
//!
//! - Out-of-order, duplicate-tolerant chunk staging with exactly-once
//!   completion detection
//! - A sequential job queue with skip/cancel semantics observed by the
//!   worker at segment boundaries
//! - A single-writer, many-reader progress board built on watch channels
//! - Change-driven progress notification with a bounded poll ceiling
//! - A subprocess-backed engine adapter speaking newline-delimited JSON
//!
//! # Example
//!
//! ```no_run
//! use tapescribe::api::{FilePart, StorageConfig, UploadService};
//! use tapescribe::engine::{SubprocessEngine, SubprocessEngineConfig};
//! use tapescribe::progress::ProgressBoard;
//! use tapescribe::queue::JobQueue;
//! use tapescribe::worker::{Worker, WorkerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = StorageConfig {
//!         inbox: "uploads".into(),
//!         staging: "chunks".into(),
//!         transcripts: "transcripts".into(),
//!     };
//!     storage.ensure_dirs().await?;
//!
//!     let queue = Arc::new(JobQueue::new());
//!     let board = Arc::new(ProgressBoard::new());
//!     let engine = Arc::new(SubprocessEngine::new(SubprocessEngineConfig {
//!         command: "whisper-segments".to_string(),
//!         args: vec![],
//!         working_dir: None,
//!     }));
//!
//!     let worker = Worker::new(
//!         Arc::clone(&queue),
//!         Arc::clone(&board),
//!         engine,
//!         WorkerConfig::new(&storage.transcripts),
//!     );
//!     let handle = worker.start();
//!
//!     let service = UploadService::new(storage, Arc::clone(&queue), board);
//!     let job_id = service
//!         .upload_file(Some(FilePart {
//!             filename: "talk.mp3".to_string(),
//!             bytes: std::fs::read("talk.mp3")?,
//!         }))
//!         .await?;
//!     let mut events = service.subscribe_progress(job_id);
//!     while let Some(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!
//!     worker.stop();
//!     handle.await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod engine;
pub mod progress;
pub mod queue;
pub mod upload;
pub mod worker;

// Re-export commonly used types for convenience
pub use api::{ChunkOutcome, ChunkUpload, FilePart, StorageConfig, UploadReply, UploadService};
pub use engine::{Segment, SubprocessEngine, SubprocessEngineConfig, TranscriptionEngine};
pub use progress::notifier::{NotifierConfig, ProgressEvent, ProgressNotifier};
pub use progress::{ProgressBoard, ProgressSnapshot};
pub use queue::{Job, JobQueue, JobStatus};
pub use worker::{Worker, WorkerConfig};

use thiserror::Error;

/// Errors that can occur in the tapescribe system
#[derive(Error, Debug)]
pub enum Error {
    /// Upload validation or staging failure
    #[error(transparent)]
    Upload(#[from] upload::UploadError),

    /// Chunk reassembly failure
    #[error(transparent)]
    Assembly(#[from] upload::assembler::AssemblyError),

    /// External engine failure
    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tapescribe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
