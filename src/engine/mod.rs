use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// One timed span of recognized speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds.
    pub start: f64,
    /// End offset in seconds.
    pub end: f64,
    /// Recognized text.
    pub text: String,
}

/// Failures at the engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(std::io::Error),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazily streamed result of one engine invocation.
pub struct TranscriptionOutput {
    /// Total duration of the source audio in seconds, known up front.
    pub duration: f64,
    /// Segments in engine-emitted order. The stream may be abandoned at any
    /// point; it need not be drained.
    pub segments: Box<dyn Iterator<Item = Result<Segment, EngineError>> + Send>,
}

impl std::fmt::Debug for TranscriptionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionOutput")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// The external transcription engine, an opaque blocking collaborator.
///
/// `transcribe` blocks until the engine has accepted the file and knows the
/// total duration, then yields segments lazily. Callers that stop consuming
/// the stream (a skip or cancel) are only guaranteed "stop consuming,
/// discard, move on"; whether engine-side work actually stops is up to the
/// implementation (`SubprocessEngine` kills its child process when the
/// stream is dropped).
pub trait TranscriptionEngine: Send + Sync {
    fn transcribe(&self, source: &Path) -> Result<TranscriptionOutput, EngineError>;
}

/// Configuration for the subprocess-backed engine.
#[derive(Debug, Clone)]
pub struct SubprocessEngineConfig {
    /// Command to run; the source file path is appended as the last arg.
    pub command: String,
    /// Arguments placed before the source path.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,
}

/// Engine that shells out to an external transcriber process.
///
/// Protocol, newline-delimited JSON on stdout: first a header
/// `{"duration": <seconds>}`, then one `{"start", "end", "text"}` object per
/// segment. stderr is inherited so engine diagnostics reach the service log.
pub struct SubprocessEngine {
    config: SubprocessEngineConfig,
}

#[derive(Deserialize)]
struct Header {
    duration: f64,
}

impl SubprocessEngine {
    pub fn new(config: SubprocessEngineConfig) -> Self {
        Self { config }
    }
}

impl TranscriptionEngine for SubprocessEngine {
    fn transcribe(&self, source: &Path) -> Result<TranscriptionOutput, EngineError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        debug!(pid = child.id(), source = %source.display(), "engine process spawned");

        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(EngineError::Protocol("engine stdout unavailable".to_string()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let header = read_header(&mut lines);
        let header = match header {
            Ok(header) => header,
            Err(e) => {
                reap(&mut child);
                return Err(e);
            }
        };

        Ok(TranscriptionOutput {
            duration: header.duration,
            segments: Box::new(SegmentLines { child, lines }),
        })
    }
}

fn read_header(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<Header, EngineError> {
    let line = lines
        .next()
        .ok_or_else(|| EngineError::Protocol("engine produced no output".to_string()))??;
    serde_json::from_str(&line)
        .map_err(|e| EngineError::Protocol(format!("bad header {line:?}: {e}")))
}

/// Kill and wait a child that will not be streamed from.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Streams segments off the child's stdout; kills the child if dropped
/// before the stream is exhausted.
struct SegmentLines {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Iterator for SegmentLines {
    type Item = Result<Segment, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next()? {
            Ok(line) if line.trim().is_empty() => self.next(),
            Ok(line) => Some(
                serde_json::from_str(&line)
                    .map_err(|e| EngineError::Protocol(format!("bad segment {line:?}: {e}"))),
            ),
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl Drop for SegmentLines {
    fn drop(&mut self) {
        // Harmless if the process already exited; reap it either way.
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) if !status.success() => {
                debug!(%status, "engine process exited abnormally")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to reap engine process"),
        }
    }
}
