//! In-flight synchronous requests.
//!
//! Each entry holds the reply channel of the connection task that keeps the
//! hook's socket open. An entry is settled exactly once: by a decision, by
//! auto-resolve when its session moves on, or by the connection going away.

use std::collections::HashMap;

use hookbridge_protocol::SyncReply;
use serde::Serialize;
use tokio::sync::oneshot;

#[derive(Debug)]
pub struct PendingAction {
    pub request_id: String,
    pub session_key: String,
    pub created_at: u64,
    responder: oneshot::Sender<SyncReply>,
}

/// What a settlement attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Delivered,
    /// The entry existed but its connection was already gone.
    ReceiverGone,
    Unknown,
}

impl Settlement {
    pub fn settled(self) -> bool {
        self != Settlement::Unknown
    }
}

/// Serializable view of one pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingInfo {
    pub request_id: String,
    pub session_key: String,
    pub created_at: u64,
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: HashMap<String, PendingAction>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. A duplicate id is rejected and the responder is
    /// handed back untouched.
    pub fn register(
        &mut self,
        request_id: String,
        session_key: String,
        created_at: u64,
        responder: oneshot::Sender<SyncReply>,
    ) -> Result<(), oneshot::Sender<SyncReply>> {
        if self.entries.contains_key(&request_id) {
            return Err(responder);
        }
        self.entries.insert(
            request_id.clone(),
            PendingAction {
                request_id,
                session_key,
                created_at,
                responder,
            },
        );
        Ok(())
    }

    pub fn decide(&mut self, request_id: &str, reply: SyncReply) -> Settlement {
        match self.entries.remove(request_id) {
            Some(action) => send(action, reply),
            None => Settlement::Unknown,
        }
    }

    /// Answer every request of `session_key` with allow. Returns the ids
    /// that were settled.
    pub fn auto_resolve_session(&mut self, session_key: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|a| a.session_key == session_key)
            .map(|a| a.request_id.clone())
            .collect();
        for id in &ids {
            if let Some(action) = self.entries.remove(id) {
                send(action, SyncReply::allow());
            }
        }
        ids
    }

    /// Forget a request without replying.
    pub fn abandon(&mut self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Re-home entries after a promotion or merge.
    pub fn rekey(&mut self, from: &str, to: &str) -> usize {
        let mut moved = 0;
        for action in self.entries.values_mut() {
            if action.session_key == from {
                action.session_key = to.to_string();
                moved += 1;
            }
        }
        moved
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn session_of(&self, request_id: &str) -> Option<&str> {
        self.entries
            .get(request_id)
            .map(|a| a.session_key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<PendingInfo> {
        let mut out: Vec<PendingInfo> = self
            .entries
            .values()
            .map(|a| PendingInfo {
                request_id: a.request_id.clone(),
                session_key: a.session_key.clone(),
                created_at: a.created_at,
            })
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        out
    }
}

fn send(action: PendingAction, reply: SyncReply) -> Settlement {
    match action.responder.send(reply) {
        Ok(()) => Settlement::Delivered,
        Err(_) => Settlement::ReceiverGone,
    }
}
