use crate::progress::notifier::{NotifierConfig, ProgressEvent, ProgressNotifier};
use crate::progress::ProgressBoard;
use crate::queue::JobQueue;
use crate::upload::assembler::FileAssembler;
use crate::upload::{
    sanitize_filename, validate_extension, ChunkStore, SessionState, UploadError,
    MAX_UPLOAD_BYTES,
};
use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// The three storage roots the service works out of.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Assembled and single-shot uploads; the worker's source files.
    pub inbox: PathBuf,
    /// In-flight chunk sessions, one subdirectory per upload.
    pub staging: PathBuf,
    /// Result artifacts, `<source stem>.txt`.
    pub transcripts: PathBuf,
}

impl StorageConfig {
    /// Create all three roots.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.inbox).await?;
        tokio::fs::create_dir_all(&self.staging).await?;
        tokio::fs::create_dir_all(&self.transcripts).await?;
        Ok(())
    }
}

/// One chunk of a chunked upload, as delivered by a front end.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    /// Original filename; sanitized before use as a path component.
    pub filename: String,
    /// Zero-based chunk index.
    pub chunk: u32,
    /// Total chunks in this upload.
    pub total_chunks: u32,
    /// Raw chunk bytes.
    pub bytes: Vec<u8>,
}

/// One complete file as delivered by a front end's file field, which may
/// be absent entirely (a malformed request).
#[derive(Debug, Clone)]
pub struct FilePart {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What a chunk upload accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; more chunks outstanding.
    Received,
    /// Final chunk: the file was assembled and a job enqueued.
    TranscriptionStarted { job_id: Uuid },
}

/// Wire reply for upload operations. Serializes to the protocol's exact
/// JSON shapes: `{"status":"chunk_received"}`,
/// `{"status":"completed","message":"Starting transcription"}`, or
/// `{"error": <message>}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UploadReply {
    Status {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'static str>,
    },
    Error {
        error: String,
    },
}

impl UploadReply {
    pub fn chunk_received() -> Self {
        UploadReply::Status {
            status: "chunk_received",
            message: None,
        }
    }

    pub fn completed() -> Self {
        UploadReply::Status {
            status: "completed",
            message: Some("Starting transcription"),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        UploadReply::Error {
            error: message.to_string(),
        }
    }

    /// Map a chunk-upload result onto the wire reply.
    pub fn from_chunk_result(result: &Result<ChunkOutcome>) -> Self {
        match result {
            Ok(ChunkOutcome::Received) => Self::chunk_received(),
            Ok(ChunkOutcome::TranscriptionStarted { .. }) => Self::completed(),
            Err(e) => Self::error(e),
        }
    }
}

/// Front-end-agnostic entry point tying the core together: chunk staging,
/// assembly, the job queue, and progress subscriptions. A web handler, a
/// desktop window, or a CLI all drive the same methods.
pub struct UploadService {
    store: ChunkStore,
    assembler: FileAssembler,
    storage: StorageConfig,
    queue: Arc<JobQueue>,
    board: Arc<ProgressBoard>,
    notifier_config: NotifierConfig,
}

impl UploadService {
    pub fn new(storage: StorageConfig, queue: Arc<JobQueue>, board: Arc<ProgressBoard>) -> Self {
        Self {
            store: ChunkStore::new(&storage.staging),
            assembler: FileAssembler::new(&storage.inbox),
            storage,
            queue,
            board,
            notifier_config: NotifierConfig::default(),
        }
    }

    /// Override the observer poll cadence.
    pub fn with_notifier_config(mut self, config: NotifierConfig) -> Self {
        self.notifier_config = config;
        self
    }

    /// Accept one chunk of a chunked upload.
    ///
    /// On the chunk that completes the session, assembles the file and
    /// enqueues a transcription job before returning.
    pub async fn upload_chunk(&self, upload: ChunkUpload) -> Result<ChunkOutcome> {
        validate_extension(&upload.filename)?;
        let session_key =
            sanitize_filename(&upload.filename).ok_or(UploadError::NoSelectedFile)?;

        let state = self
            .store
            .put_chunk(&session_key, upload.chunk, upload.total_chunks, &upload.bytes)
            .await?;

        match state {
            SessionState::Incomplete => Ok(ChunkOutcome::Received),
            SessionState::Complete => {
                let path = self.assembler.assemble(&self.store, &session_key).await?;
                let job_id = self.queue.enqueue(&path);
                info!(session = %session_key, job_id = %job_id, "upload assembled, job enqueued");
                Ok(ChunkOutcome::TranscriptionStarted { job_id })
            }
        }
    }

    /// Accept a small file in one piece and enqueue it.
    ///
    /// `None` is a request with no file field at all; an empty filename is
    /// a request with nothing selected. Both are rejected up front.
    pub async fn upload_file(&self, part: Option<FilePart>) -> Result<Uuid> {
        let part = part.ok_or(UploadError::NoFilePart)?;
        if part.filename.is_empty() {
            return Err(UploadError::NoSelectedFile.into());
        }
        validate_extension(&part.filename)?;
        if part.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(UploadError::TooLarge {
                size: part.bytes.len(),
            }
            .into());
        }
        let name = sanitize_filename(&part.filename).ok_or(UploadError::NoSelectedFile)?;

        let path = self.storage.inbox.join(&name);
        tokio::fs::write(&path, &part.bytes)
            .await
            .map_err(UploadError::Io)?;
        let job_id = self.queue.enqueue(&path);
        info!(file = %name, job_id = %job_id, "file uploaded, job enqueued");
        Ok(job_id)
    }

    /// Abandon an in-flight chunk session and delete its staging area.
    pub async fn abandon_upload(&self, filename: &str) {
        if let Some(key) = sanitize_filename(filename) {
            self.store.discard(&key).await;
        }
    }

    /// Skip the job currently being processed, if any.
    pub fn skip(&self) -> Option<Uuid> {
        self.queue.skip_current()
    }

    /// Cancel the current job and everything still queued.
    pub fn cancel(&self) -> usize {
        self.queue.cancel_all()
    }

    /// Open a change-driven progress stream for one job.
    pub fn subscribe_progress(&self, job_id: Uuid) -> mpsc::Receiver<ProgressEvent> {
        ProgressNotifier::with_config(
            Arc::clone(&self.board),
            job_id,
            self.notifier_config.clone(),
        )
        .subscribe()
    }

    /// Result artifacts, newest first.
    pub async fn list_transcripts(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.storage.transcripts).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(Error::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, path));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Read one artifact by name, or `None` if it does not exist. The name
    /// is sanitized so it cannot escape the transcripts root.
    pub async fn read_transcript(&self, name: &str) -> Result<Option<String>> {
        let Some(name) = sanitize_filename(name) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(self.storage.transcripts.join(name)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobStatus;
    use tempfile::TempDir;

    struct Fixture {
        service: UploadService,
        queue: Arc<JobQueue>,
        storage: StorageConfig,
        _root: TempDir,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let storage = StorageConfig {
            inbox: root.path().join("uploads"),
            staging: root.path().join("chunks"),
            transcripts: root.path().join("transcripts"),
        };
        storage.ensure_dirs().await.unwrap();
        let queue = Arc::new(JobQueue::new());
        let board = Arc::new(ProgressBoard::new());
        let service = UploadService::new(storage.clone(), Arc::clone(&queue), board);
        Fixture {
            service,
            queue,
            storage,
            _root: root,
        }
    }

    fn chunk(filename: &str, index: u32, total: u32, bytes: &[u8]) -> ChunkUpload {
        ChunkUpload {
            filename: filename.to_string(),
            chunk: index,
            total_chunks: total,
            bytes: bytes.to_vec(),
        }
    }

    fn part(filename: &str, bytes: &[u8]) -> FilePart {
        FilePart {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn chunked_upload_end_to_end() {
        let fx = fixture().await;

        let r = fx.service.upload_chunk(chunk("talk.mp3", 1, 2, b"world")).await;
        assert_eq!(r.unwrap(), ChunkOutcome::Received);

        let r = fx.service.upload_chunk(chunk("talk.mp3", 0, 2, b"hello ")).await;
        let outcome = r.unwrap();
        let ChunkOutcome::TranscriptionStarted { job_id } = outcome else {
            panic!("expected transcription to start, got {outcome:?}");
        };

        // Assembled file sits in the inbox and the job references it.
        let assembled = fx.storage.inbox.join("talk.mp3");
        assert_eq!(tokio::fs::read(&assembled).await.unwrap(), b"hello world");
        let job = fx.queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.source_path, assembled);

        // Staging is gone.
        assert!(!fx.storage.staging.join("talk.mp3").exists());
    }

    #[tokio::test]
    async fn invalid_extension_is_rejected_before_any_state_change() {
        let fx = fixture().await;
        let err = fx
            .service
            .upload_chunk(chunk("notes.txt", 0, 1, b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid file type");
        assert!(!fx.storage.staging.join("notes.txt").exists());

        let err = fx
            .service
            .upload_file(Some(part("notes.txt", b"x")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid file type");
    }

    #[tokio::test]
    async fn single_shot_upload_enqueues_job() {
        let fx = fixture().await;
        let job_id = fx
            .service
            .upload_file(Some(part("voice memo.m4a", b"audio")))
            .await
            .unwrap();
        let job = fx.queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.source_path.ends_with("voice_memo.m4a"));
        assert!(job.source_path.exists());
    }

    #[tokio::test]
    async fn single_shot_rejects_malformed_requests_and_oversize() {
        let fx = fixture().await;
        let err = fx.service.upload_file(None).await.unwrap_err();
        assert_eq!(err.to_string(), "No file part");

        let err = fx.service.upload_file(Some(part("", b"x"))).await.unwrap_err();
        assert_eq!(err.to_string(), "No selected file");

        let big = vec![0u8; MAX_UPLOAD_BYTES + 1];
        let err = fx
            .service
            .upload_file(Some(part("big.wav", &big)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn abandoned_session_starts_over() {
        let fx = fixture().await;
        fx.service
            .upload_chunk(chunk("talk.mp3", 0, 2, b"a"))
            .await
            .unwrap();
        fx.service.abandon_upload("talk.mp3").await;

        // A fresh session under the same key needs all chunks again.
        let r = fx.service.upload_chunk(chunk("talk.mp3", 1, 2, b"b")).await;
        assert_eq!(r.unwrap(), ChunkOutcome::Received);
    }

    #[tokio::test]
    async fn transcripts_listing_is_newest_first() {
        let fx = fixture().await;
        assert!(fx.service.list_transcripts().await.unwrap().is_empty());

        let older = fx.storage.transcripts.join("older.txt");
        let newer = fx.storage.transcripts.join("newer.txt");
        tokio::fs::write(&older, "one").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::fs::write(&newer, "two").await.unwrap();
        // Non-artifacts are ignored.
        tokio::fs::write(fx.storage.transcripts.join("junk.tmp"), "x")
            .await
            .unwrap();

        let listed = fx.service.list_transcripts().await.unwrap();
        assert_eq!(listed, vec![newer, older]);
    }

    #[tokio::test]
    async fn read_transcript_handles_missing_and_traversal() {
        let fx = fixture().await;
        tokio::fs::write(fx.storage.transcripts.join("talk.txt"), "[0.00s -> 1.00s] hi\n")
            .await
            .unwrap();

        let text = fx.service.read_transcript("talk.txt").await.unwrap();
        assert_eq!(text.as_deref(), Some("[0.00s -> 1.00s] hi\n"));
        assert!(fx.service.read_transcript("nope.txt").await.unwrap().is_none());
        assert!(fx
            .service
            .read_transcript("../../etc/passwd")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn reply_json_shapes() {
        assert_eq!(
            serde_json::to_string(&UploadReply::chunk_received()).unwrap(),
            r#"{"status":"chunk_received"}"#
        );
        assert_eq!(
            serde_json::to_string(&UploadReply::completed()).unwrap(),
            r#"{"status":"completed","message":"Starting transcription"}"#
        );
        assert_eq!(
            serde_json::to_string(&UploadReply::error("Invalid file type")).unwrap(),
            r#"{"error":"Invalid file type"}"#
        );
    }

    #[test]
    fn reply_from_result() {
        let ok: Result<ChunkOutcome> = Ok(ChunkOutcome::Received);
        assert_eq!(UploadReply::from_chunk_result(&ok), UploadReply::chunk_received());

        let started: Result<ChunkOutcome> = Ok(ChunkOutcome::TranscriptionStarted {
            job_id: Uuid::new_v4(),
        });
        assert_eq!(UploadReply::from_chunk_result(&started), UploadReply::completed());

        let err: Result<ChunkOutcome> = Err(UploadError::InvalidFileType.into());
        assert_eq!(
            UploadReply::from_chunk_result(&err),
            UploadReply::error("Invalid file type")
        );
    }
}
