//! hookbridge transport
//!
//! Picks the local channel a run should use (loopback TCP, Unix domain
//! socket, named pipe) and hides the difference behind one stream type.

pub mod endpoint;
pub mod frame;
pub mod stream;

use std::time::Duration;

use thiserror::Error;

pub use endpoint::{resolve, Endpoint, HostContext, Leg, Platform};
pub use frame::{
    collect_frame, peer_closed, read_reply_line, write_reply, SettleConfig, SettleReason,
};
pub use stream::{connect, Listener, RelayStream};

/// Errors that can occur while moving frames around
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("endpoint not supported on this platform: {0}")]
    Unsupported(String),
}
