//! hexpipe - relay payloads through an external transform subprocess
//!
//! A [`Relay`] spawns an external command and exchanges hex-encoded,
//! newline-delimited frames over the command's stdin and stdout, so an
//! independently implemented program can transform byte payloads flowing
//! through a host application:
//!
//! - **codec**: pure encode/decode between payload bytes and hex lines
//! - **process**: subprocess spawning, supervision, and teardown
//! - **relay**: writer/reader tasks and the send/recv facade
//!
//! ```no_run
//! use hexpipe::{Relay, RelayConfig};
//!
//! # async fn example() -> Result<(), hexpipe::RelayError> {
//! let relay = Relay::spawn("my-transform --mode upper", RelayConfig::default())?;
//!
//! relay.send(&b"payload"[..]).await?;
//! let transformed = relay.recv().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod process;
pub mod relay;

#[cfg(test)]
mod test_utils;

// Re-export main types for convenience
pub use codec::{DEFAULT_MAX_PAYLOAD_LEN, FrameError};
pub use process::{ProcessState, SpawnError, StopMode};
pub use relay::{BlockingStream, Relay, RelayConfig, RelayError};
