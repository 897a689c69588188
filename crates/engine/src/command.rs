//! Commands sent to the engine actor via mpsc channel.

use hookbridge_protocol::{HookEvent, SessionSummary, SyncReply};
use tokio::sync::oneshot;

use crate::engine::IngestOutcome;
use crate::pending::{PendingInfo, Settlement};

#[derive(Debug)]
pub enum EngineCommand {
    /// Apply one event. Sync events carry the channel their answer goes to.
    Ingest {
        event: Box<HookEvent>,
        responder: Option<oneshot::Sender<SyncReply>>,
        reply: Option<oneshot::Sender<IngestOutcome>>,
    },

    /// Answer a pending request.
    Decide {
        request_id: String,
        decision: SyncReply,
        reply: oneshot::Sender<Settlement>,
    },

    /// The connection behind a pending request went away.
    Abandon {
        request_id: String,
        reply: Option<oneshot::Sender<bool>>,
    },

    /// Run expiry now instead of waiting for the timer.
    Tick,

    // -- Queries (use oneshot reply channels) --
    /// Every record in the table, published or not.
    Snapshot {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    ListPending {
        reply: oneshot::Sender<Vec<PendingInfo>>,
    },
}
