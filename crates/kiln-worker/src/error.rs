//! Error kinds surfaced by the worker runner.
//!
//! Every variant carries a message a build user can act on. Failures that
//! happen while a worker is attached also carry a bounded excerpt of the
//! worker's log file, since the interesting part (a stack trace, a startup
//! error) usually landed on the worker's stderr rather than on the wire.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use kiln_worker_proto::delimited::WireError;
use thiserror::Error;

/// Most bytes of a worker log file quoted into an error message.
pub const LOG_EXCERPT_LIMIT: u64 = 4096;

/// Failure of a single `exec` invocation.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The action declared no tool files, so there is nothing to run
    /// persistently.
    #[error("worker strategy cannot execute this {mnemonic} action, because the action has no tools")]
    NoTools {
        /// Mnemonic of the offending action.
        mnemonic: String,
    },

    /// The command line carries no flag-file argument, so there is no way to
    /// hand the worker its per-request work.
    #[error(
        "worker strategy cannot execute this {mnemonic} action, because the command-line \
         arguments do not contain at least one @flagfile or --flagfile="
    )]
    NoFlagFile {
        /// Mnemonic of the offending action.
        mnemonic: String,
    },

    /// A referenced flag file could not be read.
    #[error("failed to read flag file {path}: {source}")]
    FlagFileRead {
        /// The file that failed to read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Flag-file expansion revisited a file it is still in the middle of
    /// expanding.
    #[error("flag file {path} references itself, directly or through another flag file")]
    CyclicFlagFile {
        /// The file that closed the cycle.
        path: PathBuf,
    },

    /// The pool could not produce a worker.
    #[error("failed to borrow a worker from the pool: {source}")]
    BorrowFailed {
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The worker's execution environment could not be prepared.
    #[error("failed to prepare the execution environment of a worker: {source}{log}")]
    PrepareFailed {
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
        /// Formatted excerpt of the worker's log file.
        log: String,
    },

    /// The request could not be written; the worker most likely quit or
    /// closed its stdin.
    #[error(
        "worker process quit or closed its stdin stream while a work request \
         was being sent: {source}{log}"
    )]
    RequestWrite {
        /// Underlying framing or I/O failure.
        #[source]
        source: WireError,
        /// Formatted excerpt of the worker's log file.
        log: String,
    },

    /// The worker wrote something that does not parse as a work response.
    /// Whatever it did write is quoted, since it is usually a stack trace.
    #[error("worker process returned an unparseable work response: {source}{recorded}")]
    ResponseParse {
        /// Underlying framing or decode failure.
        #[source]
        source: WireError,
        /// Text recorded from the worker's stdout around the failure.
        recorded: String,
    },

    /// The worker closed its stdout without answering.
    #[error("worker process did not return a work response{log}")]
    NoResponse {
        /// Formatted excerpt of the worker's log file.
        log: String,
    },

    /// Post-exchange cleanup on the worker failed.
    #[error("failed to finish worker execution: {source}")]
    FinishFailed {
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure on the runner's own path, e.g. the input
    /// metadata oracle or the output capture stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Formats the tail of a worker log file for inclusion in an error message.
///
/// At most `limit` bytes are quoted. Returns an empty string when the file
/// is missing, unreadable, or empty, so callers can append the result
/// unconditionally.
#[must_use]
pub fn log_excerpt(path: &Path, limit: u64) -> String {
    match read_tail(path, limit) {
        Ok(tail) if !tail.trim().is_empty() => format!(
            "\n\n---8<---8<--- start of log, file at {} ---8<---8<---\n\
             {tail}\n\
             ---8<---8<--- end of log ---8<---8<---",
            path.display()
        ),
        _ => String::new(),
    }
}

fn read_tail(path: &Path, limit: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > limit {
        file.seek(SeekFrom::Start(len - limit))?;
    }

    let mut bytes = Vec::new();
    file.take(limit).read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_log_excerpt_quotes_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-1-Javac.log");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let excerpt = log_excerpt(&path, LOG_EXCERPT_LIMIT);
        assert!(excerpt.contains("line one"));
        assert!(excerpt.contains("start of log"));
        assert!(excerpt.contains(path.display().to_string().as_str()));
    }

    #[test]
    fn test_log_excerpt_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut file = File::create(&path).unwrap();
        for _ in 0..1000 {
            writeln!(file, "0123456789abcdef").unwrap();
        }

        let excerpt = log_excerpt(&path, 64);
        // Markers plus at most 64 bytes of tail.
        assert!(excerpt.len() < 300);
        assert!(excerpt.ends_with("---8<---8<--- end of log ---8<---8<---"));
    }

    #[test]
    fn test_log_excerpt_of_missing_file_is_empty() {
        assert_eq!(log_excerpt(Path::new("/nonexistent/worker.log"), 4096), "");
    }

    #[test]
    fn test_error_messages_name_the_mnemonic() {
        let error = ExecError::NoTools {
            mnemonic: "Javac".to_string(),
        };
        assert!(error.to_string().contains("Javac"));

        let error = ExecError::NoFlagFile {
            mnemonic: "GenRule".to_string(),
        };
        assert!(error.to_string().contains("GenRule"));
        assert!(error.to_string().contains("@flagfile"));
    }
}
