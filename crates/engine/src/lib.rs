//! hookbridge engine
//!
//! Turns a stream of hook events into a deduplicated view of live sessions,
//! and parks synchronous requests until someone answers them.

pub mod command;
pub mod dedup;
pub mod engine;
pub mod key;
pub mod listener;
pub mod pending;
pub mod session;
pub mod table;
pub mod transition;
pub mod visibility;

use hookbridge_protocol::WireError;
use hookbridge_transport::TransportError;
use thiserror::Error;

pub use engine::{Engine, EngineConfig, EngineHandle, IngestOutcome};
pub use pending::{PendingInfo, Settlement};
pub use session::Session;
pub use visibility::VisibilityPolicy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is no longer running")]
    Closed,

    #[error("bad frame: {0}")]
    Wire(#[from] WireError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
