//! Session keys.
//!
//! A session is indexed by the strongest identity an event offers: session
//! id, then transcript path, then working directory. Weak keys carry a prefix
//! so they can never collide with a session id.

use hookbridge_protocol::HookEvent;

const TRANSCRIPT_PREFIX: &str = "transcript:";
const CWD_PREFIX: &str = "cwd:";

/// Canonical form of a path for identity comparisons.
///
/// Separators become `/`, repeats collapse, and trailing separators go
/// (the root stays `/`). Empty input is `None`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut prev_sep = false;
    for ch in trimmed.chars() {
        let is_sep = ch == '/' || ch == '\\';
        if is_sep {
            if !prev_sep {
                out.push('/');
            }
        } else {
            out.push(ch);
        }
        prev_sep = is_sep;
    }

    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

pub fn transcript_key(path: &str) -> String {
    format!("{TRANSCRIPT_PREFIX}{path}")
}

pub fn cwd_key(path: &str) -> String {
    format!("{CWD_PREFIX}{path}")
}

pub fn is_weak_key(key: &str) -> bool {
    key.starts_with(TRANSCRIPT_PREFIX) || key.starts_with(CWD_PREFIX)
}

/// The identity fields of one event, normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
}

impl Identity {
    pub fn of(event: &HookEvent) -> Self {
        Identity {
            session_id: event
                .session_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            transcript_path: event.transcript_path.as_deref().and_then(normalize_path),
            cwd: event.cwd.as_deref().and_then(normalize_path),
        }
    }

    pub fn transcript_key(&self) -> Option<String> {
        self.transcript_path.as_deref().map(transcript_key)
    }

    pub fn cwd_key(&self) -> Option<String> {
        self.cwd.as_deref().map(cwd_key)
    }

    /// Best key this identity can produce.
    pub fn primary_key(&self) -> Option<String> {
        self.session_id
            .clone()
            .or_else(|| self.transcript_key())
            .or_else(|| self.cwd_key())
    }

    /// Weak keys in priority order.
    pub fn weak_keys(&self) -> Vec<String> {
        [self.transcript_key(), self.cwd_key()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookbridge_protocol::EventKind;

    #[test]
    fn normalizes_separators_and_trailing_slashes() {
        assert_eq!(normalize_path("/proj/"), Some("/proj".into()));
        assert_eq!(normalize_path("/proj//sub///"), Some("/proj/sub".into()));
        assert_eq!(normalize_path(r"C:\Users\me\proj\"), Some("C:/Users/me/proj".into()));
        assert_eq!(normalize_path("/"), Some("/".into()));
        assert_eq!(normalize_path("   "), None);
    }

    #[test]
    fn primary_key_prefers_session_id_then_transcript_then_cwd() {
        let mut event = HookEvent::bare(EventKind::ToolStart, 1);
        event.cwd = Some("/proj/".into());
        assert_eq!(Identity::of(&event).primary_key(), Some("cwd:/proj".into()));

        event.transcript_path = Some("/t/s1.jsonl".into());
        assert_eq!(
            Identity::of(&event).primary_key(),
            Some("transcript:/t/s1.jsonl".into())
        );

        event.session_id = Some(" s1 ".into());
        assert_eq!(Identity::of(&event).primary_key(), Some("s1".into()));
    }

    #[test]
    fn event_without_identity_has_no_key() {
        let event = HookEvent::bare(EventKind::Stop, 1);
        assert_eq!(Identity::of(&event).primary_key(), None);
        assert!(Identity::of(&event).weak_keys().is_empty());
    }

    #[test]
    fn weak_keys_are_recognizable() {
        assert!(is_weak_key(&cwd_key("/proj")));
        assert!(is_weak_key(&transcript_key("/t.jsonl")));
        assert!(!is_weak_key("s1"));
    }
}
