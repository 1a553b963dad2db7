// Authoritative per-surface unread counters. The navigation badge is always
// `total()`; nothing else holds a count.

use std::collections::HashMap;

use crate::state::SurfaceId;

#[derive(Debug, Default)]
pub(super) struct UnreadLedger {
    counts: HashMap<SurfaceId, u32>,
}

impl UnreadLedger {
    pub(super) fn increment(&mut self, surface_id: &str) -> u32 {
        let n = self.counts.entry(surface_id.to_string()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub(super) fn set(&mut self, surface_id: &str, n: u32) {
        self.counts.insert(surface_id.to_string(), n);
    }

    pub(super) fn clear(&mut self, surface_id: &str) {
        if let Some(n) = self.counts.get_mut(surface_id) {
            *n = 0;
        }
    }

    pub(super) fn get(&self, surface_id: &str) -> u32 {
        self.counts.get(surface_id).copied().unwrap_or(0)
    }

    /// Folds a replay window's provisional count in as one write.
    pub(super) fn commit_replay(&mut self, surface_id: &str, provisional: u32) -> u32 {
        let n = self.get(surface_id).saturating_add(provisional);
        self.set(surface_id, n);
        n
    }

    pub(super) fn total(&self) -> u32 {
        self.counts.values().fold(0u32, |acc, n| acc.saturating_add(*n))
    }

    pub(super) fn remove(&mut self, surface_id: &str) {
        self.counts.remove(surface_id);
    }

    pub(super) fn clear_all(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_tracks_every_mutation() {
        let mut l = UnreadLedger::default();
        l.increment("a");
        l.increment("a");
        l.increment("b");
        assert_eq!(l.total(), 3);
        l.commit_replay("c", 4);
        assert_eq!(l.total(), 7);
        l.clear("a");
        assert_eq!(l.get("a"), 0);
        assert_eq!(l.total(), 5);
        l.set("b", 10);
        assert_eq!(l.total(), 14);
        l.remove("c");
        assert_eq!(l.total(), 10);
    }

    #[test]
    fn commit_replay_adds_to_live_increments() {
        let mut l = UnreadLedger::default();
        l.increment("a");
        assert_eq!(l.commit_replay("a", 2), 3);
        assert_eq!(l.commit_replay("a", 0), 3);
    }

    #[test]
    fn unknown_surface_reads_zero() {
        let mut l = UnreadLedger::default();
        assert_eq!(l.get("nope"), 0);
        l.clear("nope");
        assert_eq!(l.total(), 0);
        l.increment("x");
        l.clear_all();
        assert_eq!(l.total(), 0);
    }
}
