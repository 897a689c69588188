//! The session table: key resolution, promotion and merge.

use std::collections::HashMap;

use hookbridge_protocol::HookEvent;
use tracing::debug;

use crate::key::{is_weak_key, Identity};
use crate::session::Session;
use crate::transition::{transition, Effect};

/// Where an event landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: String,
    /// `(old, new)` pairs for records that were promoted or merged away.
    pub rekeyed: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the record for `identity`. `None` when the identity
    /// carries no usable key.
    pub fn resolve(&mut self, identity: &Identity) -> Option<Resolution> {
        match identity.session_id.clone() {
            Some(session_id) => Some(self.resolve_strong(session_id, identity)),
            None => self.resolve_weak(identity),
        }
    }

    fn resolve_strong(&mut self, session_id: String, identity: &Identity) -> Resolution {
        let mut rekeyed = Vec::new();

        for weak in identity.weak_keys() {
            let Some(candidate) = self.sessions.get(&weak) else {
                continue;
            };
            if candidate.is_ended() || !candidate.accepts(identity) {
                continue;
            }
            // An ended session stays ended: nothing live is folded into it.
            if self
                .sessions
                .get(&session_id)
                .map_or(false, |existing| existing.is_ended())
            {
                continue;
            }
            let Some(candidate) = self.sessions.remove(&weak) else {
                continue;
            };

            match self.sessions.remove(&session_id) {
                None => {
                    let mut promoted = candidate;
                    promoted.key = session_id.clone();
                    debug!(
                        component = "engine",
                        event = "engine.session.promoted",
                        from = %weak,
                        to = %session_id,
                    );
                    self.sessions.insert(session_id.clone(), promoted);
                    rekeyed.push((weak, session_id.clone()));
                }
                Some(existing) => {
                    match Session::merge(existing.clone(), candidate.clone(), session_id.clone()) {
                        Some(merged) => {
                            debug!(
                                component = "engine",
                                event = "engine.session.merged",
                                from = %weak,
                                into = %session_id,
                            );
                            self.sessions.insert(session_id.clone(), merged);
                            rekeyed.push((weak, session_id.clone()));
                        }
                        None => {
                            self.sessions.insert(session_id.clone(), existing);
                            self.sessions.insert(weak, candidate);
                        }
                    }
                }
            }
        }

        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone(), 0));

        Resolution {
            key: session_id,
            rekeyed,
        }
    }

    fn resolve_weak(&mut self, identity: &Identity) -> Option<Resolution> {
        let by_transcript = identity
            .transcript_path
            .as_ref()
            .and_then(|path| self.owner_of(|s| s.transcript_path.as_ref() == Some(path), identity));
        let found = by_transcript.or_else(|| {
            identity
                .cwd
                .as_ref()
                .and_then(|cwd| self.owner_of(|s| s.cwd.as_ref() == Some(cwd), identity))
        });

        let key = match found {
            Some(key) => key,
            None => {
                let key = identity.primary_key()?;
                self.sessions
                    .entry(key.clone())
                    .or_insert_with(|| Session::new(key.clone(), 0));
                key
            }
        };
        Some(Resolution {
            key,
            rekeyed: Vec::new(),
        })
    }

    /// Record that should receive an event matching `pred`: the only live
    /// match, or the most recently ended one when nothing live matches.
    /// `None` when nothing matches or several live records do.
    fn owner_of<F>(&self, pred: F, identity: &Identity) -> Option<String>
    where
        F: Fn(&Session) -> bool,
    {
        let candidates: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| pred(s) && s.accepts(identity))
            .collect();

        let mut live = candidates.iter().filter(|s| !s.is_ended());
        if let Some(first) = live.next() {
            if live.next().is_some() {
                return None;
            }
            return Some(first.key.clone());
        }

        // Routed here, a late event hits the ended record and is ignored.
        candidates
            .into_iter()
            .max_by_key(|s| s.ended_at.unwrap_or(0))
            .map(|s| s.key.clone())
    }

    /// Run the transition for `key`. Unknown keys produce no effects.
    pub fn apply(&mut self, key: &str, event: &HookEvent) -> Vec<Effect> {
        let Some(session) = self.sessions.remove(key) else {
            return Vec::new();
        };
        let (session, effects) = transition(session, event);
        self.sessions.insert(key.to_string(), session);
        effects
    }

    /// Drop records that have been ended for longer than `ttl_ms`, and any
    /// record silent for twice that. Returns the removed keys.
    pub fn prune(&mut self, now: u64, ttl_ms: u64) -> Vec<String> {
        let mut removed = Vec::new();
        self.sessions.retain(|key, session| {
            let silent = now.saturating_sub(session.last_event_at);
            let expired = if session.is_ended() {
                let ended_at = session.ended_at.unwrap_or(session.last_event_at);
                now.saturating_sub(ended_at) > ttl_ms
            } else {
                silent > ttl_ms.saturating_mul(2)
            };
            if expired {
                removed.push(key.clone());
            }
            !expired
        });
        removed
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn weak_count(&self) -> usize {
        self.sessions.keys().filter(|k| is_weak_key(k)).count()
    }
}
