//! Recently applied event ids.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);
pub const DEFAULT_DEDUP_CAP: usize = 4096;

/// Time-windowed, capped set of event ids.
///
/// `order` may hold stale entries for ids that were re-recorded after they
/// expired; eviction only drops the map entry whose timestamp matches.
#[derive(Debug)]
pub struct SeenEvents {
    max_age_ms: u64,
    cap: usize,
    order: VecDeque<(String, u64)>,
    ids: HashMap<String, u64>,
}

impl SeenEvents {
    pub fn new(window: Duration, cap: usize) -> Self {
        SeenEvents {
            max_age_ms: window.as_millis() as u64,
            cap: cap.max(1),
            order: VecDeque::new(),
            ids: HashMap::new(),
        }
    }

    /// Record `id` at `now`. Returns `false` when it was already seen within
    /// the window. Empty ids are always new.
    pub fn check_and_record(&mut self, id: &str, now: u64) -> bool {
        if id.is_empty() {
            return true;
        }
        if let Some(seen_at) = self.ids.get(id) {
            if now.saturating_sub(*seen_at) <= self.max_age_ms {
                return false;
            }
        }
        self.ids.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        if self.ids.len() > self.cap {
            self.sweep(now);
        }
        true
    }

    /// Evict by age, then by cap (oldest first). Returns how many ids went.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.ids.len();

        while let Some((_, seen_at)) = self.order.front() {
            if now.saturating_sub(*seen_at) <= self.max_age_ms {
                break;
            }
            if let Some((id, seen_at)) = self.order.pop_front() {
                self.forget(&id, seen_at);
            }
        }

        while self.ids.len() > self.cap {
            match self.order.pop_front() {
                Some((id, seen_at)) => self.forget(&id, seen_at),
                None => break,
            }
        }

        before - self.ids.len()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn forget(&mut self, id: &str, seen_at: u64) {
        if self.ids.get(id) == Some(&seen_at) {
            self.ids.remove(id);
        }
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        SeenEvents::new(DEFAULT_DEDUP_WINDOW, DEFAULT_DEDUP_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_within_window_is_dropped() {
        let mut seen = SeenEvents::default();
        assert!(seen.check_and_record("abc", 1_000));
        assert!(!seen.check_and_record("abc", 2_000));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn empty_id_is_never_deduped() {
        let mut seen = SeenEvents::default();
        assert!(seen.check_and_record("", 1_000));
        assert!(seen.check_and_record("", 1_000));
        assert!(seen.is_empty());
    }

    #[test]
    fn expired_id_is_accepted_again() {
        let mut seen = SeenEvents::new(Duration::from_secs(1), 16);
        assert!(seen.check_and_record("abc", 1_000));
        assert!(seen.check_and_record("abc", 2_500));
        assert!(!seen.check_and_record("abc", 3_000));
    }

    #[test]
    fn sweep_evicts_by_age() {
        let mut seen = SeenEvents::new(Duration::from_secs(1), 16);
        seen.check_and_record("a", 1_000);
        seen.check_and_record("b", 1_800);
        assert_eq!(seen.sweep(2_500), 1);
        assert!(seen.check_and_record("a", 2_500));
        assert!(!seen.check_and_record("b", 2_500));
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let mut seen = SeenEvents::new(Duration::from_secs(60), 2);
        seen.check_and_record("a", 1);
        seen.check_and_record("b", 2);
        seen.check_and_record("c", 3);
        assert_eq!(seen.len(), 2);
        assert!(seen.check_and_record("a", 4));
        assert!(!seen.check_and_record("c", 4));
    }

    #[test]
    fn re_recorded_id_survives_eviction_of_its_stale_entry() {
        let mut seen = SeenEvents::new(Duration::from_millis(100), 16);
        seen.check_and_record("a", 0);
        seen.check_and_record("a", 500);
        // The first entry for "a" ages out, the second must stay.
        seen.sweep(550);
        assert!(!seen.check_and_record("a", 560));
    }
}
