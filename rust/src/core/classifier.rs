// Replay/live classification and id dedup.
//
// The transport has no "end of history" marker: everything delivered from
// `track` until the grace timer fires is replay. A live message that arrives
// inside the grace window right after subscribe is misclassified as replay;
// on slow networks the window should be widened via `replay_grace_ms`.

use std::collections::{HashMap, HashSet};

use crate::state::{InboundEvent, SurfaceId};

/// Event ids already ingested this session. Never shrinks until logout.
#[derive(Debug, Default)]
pub(super) struct SeenSet {
    ids: HashSet<String>,
}

impl SeenSet {
    /// Returns true when newly inserted.
    pub(super) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    #[cfg(test)]
    pub(super) fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(super) fn clear(&mut self) {
        self.ids.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Classification {
    Replay,
    Live,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Verdict {
    Accepted(Classification),
    Duplicate,
}

#[derive(Debug)]
enum Phase {
    /// Timestamps of foreign events seen during replay.
    Replay { foreign: Vec<i64> },
    Live,
}

#[derive(Debug)]
struct SurfacePhase {
    phase: Phase,
    last_read_at: i64,
}

#[derive(Debug, Default)]
pub(super) struct ReplayClassifier {
    seen: SeenSet,
    surfaces: HashMap<SurfaceId, SurfacePhase>,
}

impl ReplayClassifier {
    /// Enters the replay window for a freshly tracked surface. `loaded` are the
    /// ids already present in the message store; they are never re-applied.
    pub(super) fn begin<'a>(
        &mut self,
        surface_id: &str,
        last_read_at: i64,
        loaded: impl IntoIterator<Item = &'a str>,
    ) {
        for id in loaded {
            self.seen.insert(id);
        }
        self.surfaces.insert(
            surface_id.to_string(),
            SurfacePhase {
                phase: Phase::Replay { foreign: Vec::new() },
                last_read_at,
            },
        );
    }

    /// Dedups and classifies one event. The id is recorded before anything
    /// else happens so a second delivery path can never double count.
    pub(super) fn classify(
        &mut self,
        surface_id: &str,
        event: &InboundEvent,
        self_id: &str,
    ) -> Verdict {
        if !self.seen.insert(&event.id) {
            return Verdict::Duplicate;
        }
        let Some(sp) = self.surfaces.get_mut(surface_id) else {
            return Verdict::Accepted(Classification::Live);
        };
        match &mut sp.phase {
            Phase::Live => Verdict::Accepted(Classification::Live),
            Phase::Replay { foreign } => {
                if event.author_id != self_id {
                    foreign.push(event.timestamp);
                }
                Verdict::Accepted(Classification::Replay)
            }
        }
    }

    /// Records ids without classification (history backfill).
    pub(super) fn mark_seen(&mut self, id: &str) -> bool {
        self.seen.insert(id)
    }

    #[cfg(test)]
    pub(super) fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Foreign replay events newer than the surface's current `last_read_at`.
    pub(super) fn provisional(&self, surface_id: &str) -> u32 {
        match self.surfaces.get(surface_id) {
            Some(SurfacePhase {
                phase: Phase::Replay { foreign },
                last_read_at,
            }) => foreign.iter().filter(|ts| **ts > *last_read_at).count() as u32,
            _ => 0,
        }
    }

    /// Closes the replay window and returns the provisional count.
    /// `None` if the surface is unknown or already live.
    pub(super) fn commit(&mut self, surface_id: &str) -> Option<u32> {
        let provisional = self.provisional(surface_id);
        let sp = self.surfaces.get_mut(surface_id)?;
        match std::mem::replace(&mut sp.phase, Phase::Live) {
            Phase::Replay { .. } => Some(provisional),
            Phase::Live => None,
        }
    }

    #[cfg(test)]
    pub(super) fn is_replaying(&self, surface_id: &str) -> bool {
        matches!(
            self.surfaces.get(surface_id).map(|s| &s.phase),
            Some(Phase::Replay { .. })
        )
    }

    pub(super) fn set_last_read_at(&mut self, surface_id: &str, at: i64) {
        if let Some(sp) = self.surfaces.get_mut(surface_id) {
            sp.last_read_at = at;
        }
    }

    pub(super) fn end(&mut self, surface_id: &str) {
        self.surfaces.remove(surface_id);
    }

    #[cfg(test)]
    pub(super) fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub(super) fn clear(&mut self) {
        self.seen.clear();
        self.surfaces.clear();
    }
}
