//! Relay core - subprocess-backed payload transformation
//!
//! Pairs an external transform command with a writer task and a reader
//! task. Payloads sent to the relay are hex-framed onto the command's
//! stdin; lines arriving on the command's stdout are decoded and handed
//! back to receivers. Bounded queues provide backpressure in both
//! directions, and a cancellation token gives the relay a teardown path
//! that unblocks every waiting caller.

use crate::codec::{self, DEFAULT_MAX_PAYLOAD_LEN};
use crate::process::{ProcessState, SpawnError, StopMode, TransformProcess};
use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Default capacity of the outbound and inbound queues.
const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Relay configuration, passed explicitly at construction time.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum raw payload size in bytes. The reader's line limit is
    /// derived from this same value, so the encode bound and the scanner
    /// bound cannot diverge.
    pub max_payload_len: usize,

    /// Capacity of the outbound and inbound queues (must be at least 1).
    /// Once the outbound queue is full, further send calls block until the
    /// writer drains it.
    pub queue_capacity: usize,

    /// Forward the transform command's stderr to the host's stderr.
    pub forward_stderr: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            forward_stderr: false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to spawn transform command: {0}")]
    Spawn(#[from] SpawnError),

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("write pipe closed: transform command no longer accepts input")]
    PipeClosed,

    #[error("end of stream: transform command produced no more output")]
    EndOfStream,
}

// ============================================================================
// Relay
// ============================================================================

/// A relay binding one external transform command to the host.
///
/// Construction spawns the subprocess and both background tasks; the relay
/// persists until the subprocess exits or [`Relay::shutdown`] is called.
/// One relay binds to exactly one subprocess for its entire lifetime -
/// restarting a dead transform is a host-level policy decision.
///
/// [`Relay::send`] and [`Relay::recv`] are safe to call concurrently from
/// any number of tasks; each direction is FIFO, with no cross-caller
/// fairness guarantee beyond that.
pub struct Relay {
    /// Command string the relay was constructed with
    command: String,

    /// Maximum raw payload size, checked before enqueueing
    max_payload_len: usize,

    /// Outbound queue feeding the writer task
    outbound_tx: mpsc::Sender<Bytes>,

    /// Inbound queue fed by the reader task
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,

    /// Shutdown signal observed by both tasks
    cancel: CancellationToken,

    /// Subprocess supervisor
    process: TransformProcess,
}

impl Relay {
    /// Spawn `command` and start the writer and reader tasks.
    ///
    /// The command string is split on whitespace into executable and
    /// arguments; there is no quoting support (see
    /// [`crate::process::split_command`]).
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(command: &str, config: RelayConfig) -> Result<Self, RelayError> {
        let (process, stdin, stdout) = TransformProcess::spawn(command, config.forward_stderr)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
        let cancel = CancellationToken::new();

        tokio::spawn(writer_task(
            stdin,
            outbound_rx,
            config.max_payload_len,
            cancel.clone(),
        ));
        tokio::spawn(reader_task(
            stdout,
            inbound_tx,
            config.max_payload_len,
            cancel.clone(),
        ));

        Ok(Self {
            command: command.to_string(),
            max_payload_len: config.max_payload_len,
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            cancel,
            process,
        })
    }

    /// Enqueue one payload for the transform command.
    ///
    /// Every accepted payload yields exactly one outbound frame, in send
    /// order. Waits while the outbound queue is at capacity
    /// (backpressure); fails with [`RelayError::PipeClosed`] once the
    /// writer task has terminated.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), RelayError> {
        let payload = payload.into();
        if payload.len() > self.max_payload_len {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_len,
            });
        }

        self.outbound_tx
            .send(payload)
            .await
            .map_err(|_| RelayError::PipeClosed)
    }

    /// Receive the next transformed payload.
    ///
    /// Waits until a decoded payload is available; fails with
    /// [`RelayError::EndOfStream`] once the reader task has terminated and
    /// the inbound queue is drained.
    pub async fn recv(&self) -> Result<Bytes, RelayError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RelayError::EndOfStream)
    }

    /// Blocking variant of [`Relay::send`] for synchronous callers.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_send(&self, payload: impl Into<Bytes>) -> Result<(), RelayError> {
        let payload = payload.into();
        if payload.len() > self.max_payload_len {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_len,
            });
        }

        self.outbound_tx
            .blocking_send(payload)
            .map_err(|_| RelayError::PipeClosed)
    }

    /// Blocking variant of [`Relay::recv`] for synchronous callers.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_recv(&self) -> Result<Bytes, RelayError> {
        self.inbound_rx
            .blocking_lock()
            .blocking_recv()
            .ok_or(RelayError::EndOfStream)
    }

    /// Blocking `std::io` byte-stream facade over this relay.
    pub fn blocking_stream(&self) -> BlockingStream<'_> {
        BlockingStream {
            relay: self,
            pending: Bytes::new(),
        }
    }

    /// Shut the relay down.
    ///
    /// Cancels both background tasks, signals the subprocess to stop, and
    /// unblocks every caller waiting on [`Relay::send`] or
    /// [`Relay::recv`]: pending sends fail with
    /// [`RelayError::PipeClosed`], pending receives drain the queue and
    /// then fail with [`RelayError::EndOfStream`].
    pub fn shutdown(&self, mode: StopMode) {
        info!("shutting down relay for '{}'", self.command);
        self.cancel.cancel();
        self.process.stop(mode);
    }

    /// Current lifecycle state of the transform subprocess.
    pub fn process_state(&self) -> ProcessState {
        self.process.state()
    }

    /// Check if the transform subprocess is still running.
    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// The command string this relay was constructed with.
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relaying traffic through '{}' command", self.command)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.process.kill_sync();
    }
}

// ============================================================================
// Writer Task
// ============================================================================

/// Background task that drains the outbound queue into the child's stdin.
///
/// Sole owner of the stdin handle, so frames are written atomically with
/// no locking. On a write failure (broken pipe once the subprocess has
/// exited) the task terminates and drops its receiver, which fails pending
/// and future send calls with `PipeClosed` instead of silently dropping
/// the error.
async fn writer_task(
    mut stdin: ChildStdin,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    max_payload_len: usize,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("writer task cancelled");
                break;
            }
            payload = outbound_rx.recv() => match payload {
                Some(payload) => payload,
                None => {
                    trace!("relay dropped, stopping writer");
                    break;
                }
            },
        };

        let frame = match codec::encode_frame(&payload, max_payload_len) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping unencodable payload: {}", e);
                continue;
            }
        };

        trace!("writing frame ({} payload bytes)", payload.len());

        // A child that stops draining its stdin blocks the write
        // indefinitely, so cancellation must be observed here too
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("writer task cancelled mid-write");
                break;
            }
            result = async {
                stdin.write_all(&frame).await?;
                stdin.flush().await
            } => result,
        };

        if let Err(e) = result {
            error!("failed to write to transform stdin: {}", e);
            break;
        }
    }

    trace!("writer task finished");
}

// ============================================================================
// Reader Task
// ============================================================================

/// Outcome of one bounded line scan.
enum LineStatus {
    /// A complete line is in the buffer (terminator stripped).
    Complete,
    /// The line exceeded the limit; all of its bytes were discarded.
    TooLong { discarded: usize },
    /// The stream ended with no pending data.
    Eof,
}

/// Read one terminator-delimited line of at most `max_len` bytes into `line`.
///
/// Input is consumed chunk by chunk, so an oversized line is discarded
/// without ever being buffered whole. A final line without a terminator is
/// still returned as complete, matching line-scanner conventions.
async fn read_frame_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<LineStatus>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut discarded = 0usize;
    let mut overflow = false;

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            // EOF
            return Ok(if overflow {
                LineStatus::TooLong { discarded }
            } else if line.is_empty() {
                LineStatus::Eof
            } else {
                LineStatus::Complete
            });
        }

        match buf.iter().position(|&b| b == codec::TERMINATOR) {
            Some(pos) => {
                if overflow {
                    discarded += pos;
                    reader.consume(pos + 1);
                    return Ok(LineStatus::TooLong { discarded });
                }
                if line.len() + pos > max_len {
                    discarded = line.len() + pos;
                    line.clear();
                    reader.consume(pos + 1);
                    return Ok(LineStatus::TooLong { discarded });
                }
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                return Ok(LineStatus::Complete);
            }
            None => {
                let n = buf.len();
                if overflow {
                    discarded += n;
                } else if line.len() + n > max_len {
                    discarded = line.len() + n;
                    line.clear();
                    overflow = true;
                } else {
                    line.extend_from_slice(buf);
                }
                reader.consume(n);
            }
        }
    }
}

/// Background task that scans the child's stdout line by line and delivers
/// decoded payloads to the inbound queue.
///
/// A single malformed or oversized frame is logged and dropped without
/// halting the stream. On EOF or a read error the task terminates and
/// drops its sender, so pending and future recv calls complete with
/// `EndOfStream` once the queue is drained.
async fn reader_task(
    stdout: ChildStdout,
    inbound_tx: mpsc::Sender<Bytes>,
    max_payload_len: usize,
    cancel: CancellationToken,
) {
    let max_line = codec::max_line_len(max_payload_len);
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("reader task cancelled");
                break;
            }
            status = read_frame_line(&mut reader, &mut line, max_line) => status,
        };

        match status {
            Ok(LineStatus::Complete) => {
                let payload = match codec::decode_frame(&line, max_payload_len) {
                    Ok(payload) => payload,
                    Err(e) => {
                        // One bad frame must not halt the stream
                        warn!("dropping malformed frame ({} bytes): {}", line.len(), e);
                        continue;
                    }
                };

                trace!("received frame ({} payload bytes)", payload.len());

                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!("reader task cancelled while delivering");
                        break;
                    }
                    result = inbound_tx.send(payload) => {
                        if result.is_err() {
                            trace!("relay dropped, stopping reader");
                            break;
                        }
                    }
                }
            }
            Ok(LineStatus::TooLong { discarded }) => {
                warn!(
                    "dropping oversized frame ({} hex characters, max: {})",
                    discarded, max_line
                );
            }
            Ok(LineStatus::Eof) => {
                trace!("transform stdout reached EOF");
                break;
            }
            Err(e) => {
                error!("failed to read from transform stdout: {}", e);
                break;
            }
        }
    }

    trace!("reader task finished");
}

// ============================================================================
// Blocking Stream Facade
// ============================================================================

/// Blocking byte-stream endpoint over a [`Relay`].
///
/// Each `write` call enqueues one payload; each `read` call dequeues one
/// transformed payload, handing out the remainder across subsequent reads
/// when the caller's buffer is smaller than the payload. Empty payloads
/// are skipped on the read side, since a byte stream cannot represent
/// them.
///
/// All calls block; do not use from within an asynchronous context.
pub struct BlockingStream<'a> {
    relay: &'a Relay,
    pending: Bytes,
}

impl io::Write for BlockingStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.relay.blocking_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Ok(buf.len()),
            Err(e @ RelayError::PayloadTooLarge { .. }) => {
                Err(io::Error::new(io::ErrorKind::InvalidInput, e))
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::BrokenPipe, e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for BlockingStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.relay.blocking_recv() {
                Ok(payload) => self.pending = payload,
                Err(RelayError::EndOfStream) => return Ok(0),
                Err(e) => return Err(io::Error::other(e)),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

// ============================================================================
// Tests
// ============================================================================
