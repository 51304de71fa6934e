//! Process launcher - transform command lifecycle
//!
//! Spawns the external transform command with its stdin/stdout piped into
//! the relay, optionally forwards its stderr to the host's own stderr, and
//! supervises the child until it exits.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop the transform subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the process to terminate (SIGTERM)
    Graceful,
    /// Kill the process immediately (SIGKILL)
    Force,
}

/// Transform subprocess lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Subprocess is currently running
    Running { pid: u32 },
    /// Subprocess has exited, on its own or after a stop request
    Exited,
}

impl ProcessState {
    /// Get the process ID if the subprocess is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            ProcessState::Exited => None,
        }
    }

    /// Check if the subprocess is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for spawning the transform command
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("empty transform command")]
    EmptyCommand,

    #[error("failed to start '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("stdin not available")]
    StdinNotAvailable,

    #[error("stdout not available")]
    StdoutNotAvailable,

    #[error("stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Command Splitting
// ============================================================================

/// Split a command string into executable and arguments.
///
/// Splitting is on whitespace only. There is no quoting support, so
/// executable paths or arguments that themselves contain spaces cannot be
/// expressed; callers needing those must invoke a wrapper script instead.
pub fn split_command(command: &str) -> Result<(String, Vec<String>), SpawnError> {
    let mut parts = command.split_whitespace().map(String::from);
    let program = parts.next().ok_or(SpawnError::EmptyCommand)?;
    Ok((program, parts.collect()))
}

// ============================================================================
// Transform Process
// ============================================================================

/// Supervisor handle for a spawned transform command.
///
/// The child's stdin and stdout are handed to the relay's writer and reader
/// tasks at spawn time; this handle only tracks lifecycle state and owns the
/// stderr-forwarding and wait tasks.
pub struct TransformProcess {
    /// Thread-safe subprocess state, updated by the wait task
    state: Arc<Mutex<ProcessState>>,

    /// Stderr forwarding task handle (verbose mode only)
    stderr_task: Option<JoinHandle<()>>,

    /// Wait task handle (reaps the child and records its exit)
    wait_task: Option<JoinHandle<()>>,
}

impl TransformProcess {
    /// Spawn the transform command with piped stdio.
    ///
    /// Returns the supervisor handle together with the child's stdin and
    /// stdout. When `forward_stderr` is set, the child's stderr is copied
    /// byte-for-byte to the host's stderr (a pass-through, never
    /// interpreted); otherwise it is discarded.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        command: &str,
        forward_stderr: bool,
    ) -> Result<(Self, ChildStdin, ChildStdout), SpawnError> {
        let (program, args) = split_command(command)?;

        info!("starting transform command: {} {:?}", program, args);

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .spawn()
            .map_err(|source| SpawnError::Io {
                command: command.to_string(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| SpawnError::Io {
            command: command.to_string(),
            source: io::Error::other("failed to get process ID"),
        })?;

        info!("transform command started with PID: {}", pid);

        let stdin = child.stdin.take().ok_or(SpawnError::StdinNotAvailable)?;
        let stdout = child.stdout.take().ok_or(SpawnError::StdoutNotAvailable)?;

        let stderr_task = if forward_stderr {
            let stderr = child.stderr.take().ok_or(SpawnError::StderrNotAvailable)?;
            Some(tokio::spawn(async move {
                let mut stderr = stderr;
                let mut host_stderr = tokio::io::stderr();
                if let Err(e) = tokio::io::copy(&mut stderr, &mut host_stderr).await {
                    error!("failed to forward transform stderr: {}", e);
                }
                trace!("stderr forwarding finished");
            }))
        } else {
            None
        };

        let state = Arc::new(Mutex::new(ProcessState::Running { pid }));

        // Wait task: reap the child and record its exit so the relay can
        // distinguish a live subprocess from a dead one
        let wait_state = Arc::clone(&state);
        let wait_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!("transform command PID {} exited with status: {}", pid, status);
                }
                Err(e) => {
                    error!("error waiting for transform command PID {}: {}", pid, e);
                }
            }

            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            *wait_state.lock().unwrap() = ProcessState::Exited;
        });

        Ok((
            Self {
                state,
                stderr_task,
                wait_task: Some(wait_task),
            },
            stdin,
            stdout,
        ))
    }

    /// Current subprocess state (thread-safe)
    pub fn state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Check if the subprocess is currently running
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Signal the subprocess to stop.
    ///
    /// The wait task observes the actual exit and transitions the state to
    /// [`ProcessState::Exited`]; a process that ignores SIGTERM can be
    /// followed up with [`StopMode::Force`].
    pub fn stop(&self, mode: StopMode) {
        let pid = match self.state().pid() {
            Some(pid) => pid,
            None => return, // Already exited
        };

        match mode {
            StopMode::Graceful => info!("gracefully stopping transform command PID {}", pid),
            StopMode::Force => info!("force killing transform command PID {}", pid),
        }

        #[cfg(unix)]
        unsafe {
            let signal = match mode {
                StopMode::Graceful => libc::SIGTERM,
                StopMode::Force => libc::SIGKILL,
            };
            libc::kill(pid as libc::pid_t, signal);
        }

        #[cfg(not(unix))]
        tracing::warn!("non-unix process termination not implemented");
    }

    /// Synchronous force kill for Drop implementations.
    ///
    /// Skips all async cleanup and kills the process directly; the tokio
    /// runtime reaps the child in the background.
    pub fn kill_sync(&mut self) {
        if let Some(pid) = self.state().pid() {
            trace!("synchronously killing transform command PID {}", pid);

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(task) = self.wait_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Poll the supervisor until the child is observed as exited
    async fn wait_for_exit(process: &TransformProcess) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while process.is_running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("transform command did not exit in time");
    }

    #[test]
    fn test_split_command_basic() {
        let (program, args) = split_command("cat").unwrap();
        assert_eq!(program, "cat");
        assert!(args.is_empty());
    }

    #[test]
    fn test_split_command_with_args() {
        let (program, args) = split_command("my-transform --mode upper -v").unwrap();
        assert_eq!(program, "my-transform");
        assert_eq!(args, vec!["--mode", "upper", "-v"]);
    }

    #[test]
    fn test_split_command_collapses_whitespace() {
        let (program, args) = split_command("  cat   -u ").unwrap();
        assert_eq!(program, "cat");
        assert_eq!(args, vec!["-u"]);
    }

    #[test]
    fn test_split_command_empty() {
        assert!(matches!(split_command(""), Err(SpawnError::EmptyCommand)));
        assert!(matches!(split_command("   "), Err(SpawnError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let result = TransformProcess::spawn("definitely-not-a-real-command-42", false);
        assert!(matches!(result, Err(SpawnError::Io { .. })));
    }

    #[tokio::test]
    async fn test_spawn_and_observe_exit() {
        let (process, _stdin, _stdout) = TransformProcess::spawn("true", false).unwrap();

        // The wait task records the exit once the child is reaped
        wait_for_exit(&process).await;
        assert_eq!(process.state(), ProcessState::Exited);
        assert!(process.state().pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_graceful() {
        let (process, _stdin, _stdout) = TransformProcess::spawn("sleep 30", false).unwrap();
        assert!(process.is_running());
        assert!(process.state().pid().is_some());

        process.stop(StopMode::Graceful);
        wait_for_exit(&process).await;
    }

    #[tokio::test]
    async fn test_stop_force() {
        let (process, _stdin, _stdout) = TransformProcess::spawn("sleep 30", false).unwrap();

        process.stop(StopMode::Force);
        wait_for_exit(&process).await;

        // Stopping an already-exited process is a no-op
        process.stop(StopMode::Force);
    }
}
