use super::ChunkStore;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Failures while concatenating a completed session.
#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("session {session} is not complete")]
    SessionNotComplete { session: String },

    #[error("chunk {index} missing at assembly time")]
    MissingChunk { index: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Concatenates a completed chunk session into a single inbox file.
#[derive(Debug, Clone)]
pub struct FileAssembler {
    inbox: PathBuf,
}

impl FileAssembler {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }

    /// Deterministic output path for a session key.
    pub fn output_path(&self, session_key: &str) -> PathBuf {
        self.inbox.join(session_key)
    }

    /// Assemble a finalized session into `<inbox>/<session_key>`.
    ///
    /// Chunks are read in strict ascending index order and written verbatim;
    /// the output is flushed to disk before any cleanup starts. If a chunk
    /// has gone missing (a concurrent abandon), the partial output is
    /// removed before the error propagates, so no torn artifact is ever left
    /// behind. Staging removal on success is best-effort.
    pub async fn assemble(
        &self,
        store: &ChunkStore,
        session_key: &str,
    ) -> Result<PathBuf, AssemblyError> {
        let total = store
            .finalized_total(session_key)
            .ok_or_else(|| AssemblyError::SessionNotComplete {
                session: session_key.to_string(),
            })?;

        let output_path = self.output_path(session_key);
        tokio::fs::create_dir_all(&self.inbox).await?;

        match self.concat_chunks(store, session_key, total, &output_path).await {
            Ok(()) => {}
            Err(e) => {
                remove_partial(&output_path).await;
                return Err(e);
            }
        }

        info!(session = session_key, path = %output_path.display(), total, "assembled upload");
        store.discard(session_key).await;
        Ok(output_path)
    }

    async fn concat_chunks(
        &self,
        store: &ChunkStore,
        session_key: &str,
        total: u32,
        output_path: &Path,
    ) -> Result<(), AssemblyError> {
        let mut output = tokio::fs::File::create(output_path).await?;
        for index in 0..total {
            let chunk_path = store.chunk_path(session_key, index);
            let bytes = match tokio::fs::read(&chunk_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(AssemblyError::MissingChunk { index });
                }
                Err(e) => return Err(e.into()),
            };
            output.write_all(&bytes).await?;
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}
