//! hookbridge protocol
//!
//! Types and framing shared by the hook dispatcher, the relay daemon and
//! consumers. Frames travel one per connection over a local socket.

use uuid::Uuid;

pub mod event;
pub mod reply;
pub mod types;
pub mod wire;

pub use event::{HookEvent, HookPayload};
pub use reply::{Decision, SyncReply};
pub use types::*;
pub use wire::{decode_frame, encode_frame, fingerprint, Frame, RawEvent, WireError};

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Hex prefix of the SHA-256 of `input`, used for stable short names.
pub fn short_hash(input: &[u8], chars: usize) -> String {
    let hash = ring::digest::digest(&ring::digest::SHA256, input);
    wire::hex_prefix(hash.as_ref(), chars)
}

/// Current time in unix millis.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
