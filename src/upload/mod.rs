pub mod assembler;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Audio extensions accepted for upload.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac"];

/// Single-shot upload size cap (100 MiB).
pub const MAX_UPLOAD_BYTES: usize = 104_857_600;

/// Validation failures on the upload path. These are rejected synchronously
/// and mutate no state.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No file part")]
    NoFilePart,

    #[error("No selected file")]
    NoSelectedFile,

    #[error("Invalid file type")]
    InvalidFileType,

    #[error("File too large ({size} bytes, limit {MAX_UPLOAD_BYTES})")]
    TooLarge { size: usize },

    #[error("Chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("total_chunks {got} does not match session value {expected}")]
    TotalMismatch { expected: u32, got: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a chunk write completed its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// All indices `0..total` have now been received. Returned exactly once
    /// per session, to the caller whose write completed the set.
    Complete,
    /// More chunks are still outstanding (or the session already finalized).
    Incomplete,
}

/// Reduce an uploaded filename to a safe path component.
///
/// Directory parts are stripped and anything outside `[A-Za-z0-9._-]` is
/// replaced with `_`; leading dots are dropped so the result can never be
/// hidden or a traversal. Returns `None` when nothing safe remains.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = Path::new(raw).file_name()?.to_string_lossy();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Check an (unsanitized) filename against the allowed audio extensions.
pub fn validate_extension(filename: &str) -> Result<(), UploadError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(UploadError::InvalidFileType),
    }
}

#[derive(Debug)]
struct Session {
    total: u32,
    received: HashSet<u32>,
    finalized: bool,
}

/// Durable staging area for in-flight chunked uploads.
///
/// Chunks land under `<root>/<session_key>/chunk_<index>`; the session key
/// is the sanitized original filename. Arrival order is unconstrained and
/// duplicate indices overwrite. The in-memory session map is the single
/// point of truth for completion: the received-set update and the
/// "did this write finish the session" check happen under one lock, so two
/// racing last-chunk writes cannot both trigger assembly.
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
    sessions: Mutex<HashMap<String, Session>>,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Staging path of one chunk.
    pub fn chunk_path(&self, session_key: &str, index: u32) -> PathBuf {
        self.root.join(session_key).join(format!("chunk_{index}"))
    }

    /// Staging directory of one session.
    pub fn session_dir(&self, session_key: &str) -> PathBuf {
        self.root.join(session_key)
    }

    /// Persist one chunk and report whether it completed the session.
    ///
    /// `index` must lie in `[0, total)` and `total` must match the value the
    /// session was created with; violations fail fast without touching the
    /// session. Writing an index twice is idempotent.
    pub async fn put_chunk(
        &self,
        session_key: &str,
        index: u32,
        total: u32,
        bytes: &[u8],
    ) -> Result<SessionState, UploadError> {
        if total == 0 || index >= total {
            return Err(UploadError::IndexOutOfRange { index, total });
        }

        // Validate against (or create) the session before writing anything.
        {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(session_key) {
                Some(session) if session.total != total => {
                    return Err(UploadError::TotalMismatch {
                        expected: session.total,
                        got: total,
                    });
                }
                Some(_) => {}
                None => {
                    sessions.insert(
                        session_key.to_string(),
                        Session {
                            total,
                            received: HashSet::new(),
                            finalized: false,
                        },
                    );
                    info!(session = session_key, total, "upload session opened");
                }
            }
        }

        let path = self.chunk_path(session_key, index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(session = session_key, index, len = bytes.len(), "chunk stored");

        // Record the index and decide completion atomically.
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(session_key) else {
            // Session abandoned while the chunk was being written.
            return Ok(SessionState::Incomplete);
        };
        session.received.insert(index);
        if !session.finalized && session.received.len() as u32 == session.total {
            session.finalized = true;
            info!(session = session_key, total, "upload session complete");
            Ok(SessionState::Complete)
        } else {
            Ok(SessionState::Incomplete)
        }
    }

    /// Total chunk count of a finalized session, if it is finalized.
    pub fn finalized_total(&self, session_key: &str) -> Option<u32> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_key)
            .filter(|s| s.finalized)
            .map(|s| s.total)
    }

    /// Drop a session and its staging directory.
    ///
    /// Used both for explicit abandons and for post-assembly cleanup; the
    /// directory removal is best-effort.
    pub async fn discard(&self, session_key: &str) {
        self.sessions.lock().unwrap().remove(session_key);
        let dir = self.session_dir(session_key);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = session_key, error = %e, "failed to remove staging dir");
            }
        }
    }
}
