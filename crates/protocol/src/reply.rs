//! Replies to synchronous hook events.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the agent continue. Also the answer when nobody answered.
    #[default]
    Allow,
    /// Refuse a permission request.
    Deny,
    /// Defer to the agent's own prompt.
    Ask,
    /// Stop a lifecycle transition (e.g. keep the agent working after `stop`).
    Block,
}

/// One line sent back over a held connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncReply {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set when the relay answered on the consumer's behalf.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub neutral: bool,
}

impl SyncReply {
    /// What a hook gets when the consumer is absent, slow, or confused.
    pub fn neutral() -> Self {
        SyncReply {
            decision: Decision::Allow,
            reason: None,
            neutral: true,
        }
    }

    pub fn allow() -> Self {
        SyncReply {
            decision: Decision::Allow,
            reason: None,
            neutral: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        SyncReply {
            decision: Decision::Deny,
            reason: Some(reason.into()),
            neutral: false,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        SyncReply {
            decision: Decision::Block,
            reason: Some(reason.into()),
            neutral: false,
        }
    }

    /// Serialize as a newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }

    /// Parse a reply line; anything unreadable degrades to neutral.
    pub fn parse_line(line: &str) -> SyncReply {
        let line = line.trim();
        if line.is_empty() {
            return SyncReply::neutral();
        }
        serde_json::from_str(line).unwrap_or_else(|_| SyncReply::neutral())
    }
}
