//! The worker I/O driver: one request out, one response in.
//!
//! The worker's stdout is wrapped in a [`RecordingReader`] while the
//! response is parsed, so that when a worker prints a stack trace instead
//! of a length-delimited message, the error shown to the user quotes what
//! the worker actually wrote.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use kiln_worker_proto::delimited::{read_delimited, write_delimited};
use kiln_worker_proto::{WorkRequest, WorkResponse};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{ExecError, LOG_EXCERPT_LIMIT, log_excerpt};
use crate::key::WorkerKey;
use crate::pool::Worker;
use crate::spawn::ExecutionPolicy;

/// Bytes of worker stdout kept since the last [`RecordingReader::start_recording`].
pub const RECORDING_WINDOW: usize = 4096;

/// An `AsyncRead` adapter keeping a bounded copy of everything it reads.
pub struct RecordingReader<R> {
    inner: R,
    recording: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> RecordingReader<R> {
    /// Wraps `inner`. Nothing is recorded until
    /// [`start_recording`](Self::start_recording) is called.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            recording: Vec::new(),
            limit: 0,
        }
    }

    /// Discards the current recording and keeps the next `limit` bytes.
    pub fn start_recording(&mut self, limit: usize) {
        self.recording.clear();
        self.limit = limit;
    }

    /// The bytes recorded so far.
    #[must_use]
    pub fn recorded(&self) -> &[u8] {
        &self.recording
    }

    /// The recording as text, for quoting into an error message.
    #[must_use]
    pub fn recorded_text(&self) -> String {
        String::from_utf8_lossy(&self.recording).into_owned()
    }

    /// Pulls whatever the stream still has readily available into the
    /// recording, up to the limit.
    ///
    /// Used after a parse failure: the stack trace the worker printed is
    /// usually longer than what the parser consumed. Reading stops at EOF,
    /// at the recording limit, or once the stream stalls.
    pub async fn read_remaining(&mut self) {
        let mut chunk = [0u8; 512];
        while self.recording.len() < self.limit {
            match tokio::time::timeout(Duration::from_millis(100), self.inner.read(&mut chunk))
                .await
            {
                Ok(Ok(read)) if read > 0 => {
                    let room = self.limit - self.recording.len();
                    self.recording.extend_from_slice(&chunk[..read.min(room)]);
                },
                // EOF, error, or nothing buffered: the recording is as good
                // as it is going to get.
                _ => break,
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let already_filled = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[already_filled..];
                let room = this.limit.saturating_sub(this.recording.len());
                this.recording.extend_from_slice(&fresh[..fresh.len().min(room)]);
                Poll::Ready(Ok(()))
            },
            other => other,
        }
    }
}

/// Drives one request/response exchange over a borrowed worker.
///
/// Sequence: prepare the worker, write the delimited request and flush,
/// parse one delimited response while recording, lock the spawn's output
/// files, reject an EOF response, finish the worker.
///
/// The caller owns the worker's fate: on `Ok` it may be returned to the
/// pool, on `Err` its stream state is unknown and it must be invalidated.
///
/// # Errors
///
/// Returns the [`ExecError`] kind matching the step that failed, with the
/// worker's log excerpt or the recorded stdout bytes attached.
pub async fn exchange(
    worker: &mut dyn Worker,
    key: &WorkerKey,
    request: &WorkRequest,
    policy: &mut dyn ExecutionPolicy,
) -> Result<WorkResponse, ExecError> {
    let log_file = worker.log_file().to_path_buf();

    worker
        .prepare_execution(key)
        .map_err(|source| ExecError::PrepareFailed {
            source,
            log: log_excerpt(&log_file, LOG_EXCERPT_LIMIT),
        })?;

    write_delimited(worker.request_stream(), request)
        .await
        .map_err(|source| ExecError::RequestWrite {
            source,
            log: log_excerpt(&log_file, LOG_EXCERPT_LIMIT),
        })?;

    let mut reader = RecordingReader::new(worker.response_stream());
    reader.start_recording(RECORDING_WINDOW);

    let response: Option<WorkResponse> = match read_delimited(&mut reader).await {
        Ok(response) => response,
        Err(source) => {
            reader.read_remaining().await;
            return Err(ExecError::ResponseParse {
                source,
                recorded: reader.recorded_text(),
            });
        },
    };

    // The parse attempt is over; from here on the response, present or
    // not, decides the build graph's view of the outputs.
    policy.lock_output_files();

    let Some(response) = response else {
        return Err(ExecError::NoResponse {
            log: log_excerpt(&log_file, LOG_EXCERPT_LIMIT),
        });
    };

    worker
        .finish_execution(key)
        .map_err(|source| ExecError::FinishFailed { source })?;

    Ok(response)
}
