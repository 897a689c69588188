//! What a hook process prints and returns for a consumer's reply.

use std::io::Write;

use hookbridge_protocol::{Decision, EventKind, SyncReply};
use serde_json::json;

/// Exit code the agent treats as "blocked, reason on stderr".
pub const EXIT_BLOCK: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
}

impl HookOutput {
    pub fn success() -> Self {
        HookOutput {
            stdout: None,
            stderr: None,
            exit_code: 0,
        }
    }

    /// Write to the process streams and return the exit code.
    pub fn emit(&self) -> i32 {
        if let Some(out) = &self.stdout {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{out}");
            let _ = stdout.flush();
        }
        if let Some(err) = &self.stderr {
            let _ = writeln!(std::io::stderr(), "{err}");
        }
        self.exit_code
    }
}

pub fn translate(kind: EventKind, reply: &SyncReply) -> HookOutput {
    match kind {
        EventKind::PermissionRequest => permission_output(reply),
        EventKind::Stop
        | EventKind::SubagentStop
        | EventKind::TaskCompleted
        | EventKind::TeammateIdle => lifecycle_output(kind, reply),
        EventKind::SessionStart
        | EventKind::UserPrompt
        | EventKind::ToolStart
        | EventKind::ToolEnd
        | EventKind::ToolFailure
        | EventKind::SubagentStart
        | EventKind::Notification
        | EventKind::PreCompact
        | EventKind::SessionEnd
        | EventKind::Unknown => HookOutput::success(),
    }
}

fn permission_output(reply: &SyncReply) -> HookOutput {
    if reply.neutral {
        return HookOutput::success();
    }
    let decision = match reply.decision {
        Decision::Allow => json!({ "behavior": "allow" }),
        Decision::Deny | Decision::Block => json!({
            "behavior": "deny",
            "message": reply.reason.clone().unwrap_or_else(|| "Denied".to_string()),
        }),
        Decision::Ask => return HookOutput::success(),
    };
    let body = json!({
        "hookSpecificOutput": {
            "hookEventName": "PermissionRequest",
            "decision": decision,
        }
    });
    HookOutput {
        stdout: Some(body.to_string()),
        stderr: None,
        exit_code: 0,
    }
}

fn lifecycle_output(kind: EventKind, reply: &SyncReply) -> HookOutput {
    match reply.decision {
        Decision::Block | Decision::Deny if !reply.neutral => HookOutput {
            stdout: None,
            stderr: Some(
                reply
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{kind} blocked")),
            ),
            exit_code: EXIT_BLOCK,
        },
        _ => HookOutput::success(),
    }
}
