// Surface registry: which surfaces are of interest and the subscription
// handle + generation for each.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::collaborators::{GenerationToken, SubscriptionHandle};
use crate::state::{SubscriptionStatus, SurfaceDescriptor, SurfaceId};

pub(super) enum SubscriptionState {
    Resolving,
    Subscribing,
    Subscribed {
        handle: SubscriptionHandle,
        live: bool,
    },
    /// Left untracked after a transient failure; the next reconcile retries.
    Failed,
}

impl SubscriptionState {
    fn is_tracked(&self) -> bool {
        !matches!(self, SubscriptionState::Failed)
    }

    fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::Resolving => SubscriptionStatus::Resolving,
            SubscriptionState::Subscribing => SubscriptionStatus::Subscribing,
            SubscriptionState::Subscribed { live: false, .. } => SubscriptionStatus::Replaying,
            SubscriptionState::Subscribed { live: true, .. } => SubscriptionStatus::Live,
            SubscriptionState::Failed => SubscriptionStatus::Failed,
        }
    }
}

pub(super) struct SurfaceEntry {
    pub(super) descriptor: SurfaceDescriptor,
    pub(super) state: SubscriptionState,
}

impl SurfaceEntry {
    pub(super) fn into_handle(self) -> Option<SubscriptionHandle> {
        match self.state {
            SubscriptionState::Subscribed { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct ReconcilePlan {
    pub(super) to_track: Vec<SurfaceDescriptor>,
    pub(super) to_untrack: Vec<SurfaceId>,
    /// Already tracked surfaces whose descriptor carried a newer `last_read_at`.
    pub(super) read_marks: Vec<(SurfaceId, i64)>,
}

#[derive(Default)]
pub(super) struct SurfaceRegistry {
    entries: HashMap<SurfaceId, SurfaceEntry>,
    // Outlives entries so generations stay monotonic across untrack/track.
    generations: HashMap<SurfaceId, Arc<AtomicU64>>,
}

impl SurfaceRegistry {
    fn bump(&mut self, surface_id: &str) -> GenerationToken {
        let current = self
            .generations
            .entry(surface_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let generation = current.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationToken::new(surface_id.to_string(), generation, current)
    }

    /// Begins tracking. Returns `None` when the surface already has a
    /// subscription in progress or established.
    pub(super) fn track(&mut self, descriptor: SurfaceDescriptor) -> Option<GenerationToken> {
        if self
            .entries
            .get(&descriptor.surface_id)
            .is_some_and(|e| e.state.is_tracked())
        {
            return None;
        }
        let token = self.bump(&descriptor.surface_id);
        let state = if descriptor.kind.is_conversation() {
            SubscriptionState::Resolving
        } else {
            SubscriptionState::Subscribing
        };
        self.entries.insert(
            descriptor.surface_id.clone(),
            SurfaceEntry { descriptor, state },
        );
        Some(token)
    }

    /// Removes the surface and invalidates its generation so in-flight work aborts.
    pub(super) fn untrack(&mut self, surface_id: &str) -> Option<SurfaceEntry> {
        let entry = self.entries.remove(surface_id)?;
        self.bump(surface_id);
        Some(entry)
    }

    pub(super) fn reconcile(&self, desired: &[SurfaceDescriptor]) -> ReconcilePlan {
        let wanted: HashSet<&str> = desired.iter().map(|d| d.surface_id.as_str()).collect();
        let mut plan = ReconcilePlan::default();
        let mut queued: HashSet<&str> = HashSet::new();
        for d in desired {
            if !queued.insert(d.surface_id.as_str()) {
                continue;
            }
            match self.entries.get(&d.surface_id) {
                Some(e) if e.state.is_tracked() => {
                    if d.last_read_at > e.descriptor.last_read_at {
                        plan.read_marks.push((d.surface_id.clone(), d.last_read_at));
                    }
                }
                _ => plan.to_track.push(d.clone()),
            }
        }
        let mut stale: Vec<SurfaceId> = self
            .entries
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        plan.to_untrack = stale;
        plan
    }

    pub(super) fn is_current(&self, surface_id: &str, generation: u64) -> bool {
        self.entries
            .get(surface_id)
            .is_some_and(|e| e.state.is_tracked())
            && self
                .generations
                .get(surface_id)
                .is_some_and(|g| g.load(Ordering::SeqCst) == generation)
    }

    pub(super) fn token(&self, surface_id: &str) -> Option<GenerationToken> {
        let entry = self.entries.get(surface_id)?;
        if !entry.state.is_tracked() {
            return None;
        }
        let current = self.generations.get(surface_id)?.clone();
        let generation = current.load(Ordering::SeqCst);
        Some(GenerationToken::new(
            surface_id.to_string(),
            generation,
            current,
        ))
    }

    pub(super) fn mark_subscribing(&mut self, surface_id: &str) {
        if let Some(e) = self.entries.get_mut(surface_id) {
            e.state = SubscriptionState::Subscribing;
        }
    }

    /// Stores the handle if `generation` is still current; hands it back otherwise.
    pub(super) fn attach(
        &mut self,
        surface_id: &str,
        generation: u64,
        handle: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        if !self.is_current(surface_id, generation) {
            return Err(handle);
        }
        match self.entries.get_mut(surface_id) {
            Some(e) => {
                e.state = SubscriptionState::Subscribed {
                    handle,
                    live: false,
                };
                Ok(())
            }
            None => Err(handle),
        }
    }

    pub(super) fn mark_live(&mut self, surface_id: &str) {
        if let Some(SurfaceEntry {
            state: SubscriptionState::Subscribed { live, .. },
            ..
        }) = self.entries.get_mut(surface_id)
        {
            *live = true;
        }
    }

    /// Leaves the surface untracked after a failed resolve/subscribe.
    pub(super) fn fail(&mut self, surface_id: &str) {
        if let Some(e) = self.entries.get_mut(surface_id) {
            e.state = SubscriptionState::Failed;
        }
        self.bump(surface_id);
    }

    pub(super) fn set_last_read_at(&mut self, surface_id: &str, at: i64) {
        if let Some(e) = self.entries.get_mut(surface_id) {
            e.descriptor.last_read_at = at;
        }
    }

    pub(super) fn descriptor(&self, surface_id: &str) -> Option<&SurfaceDescriptor> {
        self.entries.get(surface_id).map(|e| &e.descriptor)
    }

    pub(super) fn contains(&self, surface_id: &str) -> bool {
        self.entries.contains_key(surface_id)
    }

    /// (descriptor, status) sorted by surface id.
    pub(super) fn summaries(&self) -> Vec<(&SurfaceDescriptor, SubscriptionStatus)> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .map(|e| (&e.descriptor, e.state.status()))
            .collect();
        out.sort_by(|a, b| a.0.surface_id.cmp(&b.0.surface_id));
        out
    }

    /// Untracks everything (logout).
    pub(super) fn drain(&mut self) -> Vec<SurfaceEntry> {
        let ids: Vec<SurfaceId> = self.entries.keys().cloned().collect();
        ids.iter().filter_map(|id| self.untrack(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::collaborators::Subscription;

    struct CountingSub(Arc<AtomicUsize>);

    impl Subscription for CountingSub {
        fn unsubscribe(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ch(id: &str) -> SurfaceDescriptor {
        SurfaceDescriptor::channel(id, "node-1")
    }

    #[test]
    fn track_is_idempotent_and_generations_increase() {
        let mut reg = SurfaceRegistry::default();
        let t1 = reg.track(ch("a")).expect("first track");
        assert!(reg.track(ch("a")).is_none());
        reg.untrack("a");
        assert!(!t1.is_current());
        let t2 = reg.track(ch("a")).expect("retrack");
        assert!(t2.generation() > t1.generation());
        assert!(t2.is_current());
    }

    #[test]
    fn conversations_start_in_resolving() {
        let mut reg = SurfaceRegistry::default();
        reg.track(SurfaceDescriptor::conversation("dm:bob", "bob"));
        reg.track(ch("general"));
        let statuses: Vec<_> = reg.summaries().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statuses,
            vec![SubscriptionStatus::Resolving, SubscriptionStatus::Subscribing]
        );
    }

    #[test]
    fn reconcile_diffs_desired_against_tracked() {
        let mut reg = SurfaceRegistry::default();
        reg.track(ch("a"));
        reg.track(ch("b"));
        let plan = reg.reconcile(&[ch("b").with_last_read_at(50), ch("c"), ch("c")]);
        assert_eq!(plan.to_track, vec![ch("c")]);
        assert_eq!(plan.to_untrack, vec!["a".to_string()]);
        assert_eq!(plan.read_marks, vec![("b".to_string(), 50)]);
    }

    #[test]
    fn failed_surfaces_are_retracked_by_reconcile() {
        let mut reg = SurfaceRegistry::default();
        let t = reg.track(ch("a")).unwrap();
        reg.fail("a");
        assert!(!t.is_current());
        assert!(!reg.is_current("a", t.generation()));
        let plan = reg.reconcile(&[ch("a")]);
        assert_eq!(plan.to_track, vec![ch("a")]);
        assert!(reg.track(ch("a")).is_some());
    }

    #[test]
    fn stale_attach_returns_the_handle() {
        let mut reg = SurfaceRegistry::default();
        let t = reg.track(ch("a")).unwrap();
        reg.untrack("a");
        let count = Arc::new(AtomicUsize::new(0));
        let handle = SubscriptionHandle::new(CountingSub(count.clone()));
        let back = reg
            .attach("a", t.generation(), handle)
            .expect_err("stale attach must be refused");
        back.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_then_live_then_drain() {
        let mut reg = SurfaceRegistry::default();
        let t = reg.track(ch("a")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        reg.attach("a", t.generation(), SubscriptionHandle::new(CountingSub(count.clone())))
            .expect("current attach");
        assert_eq!(reg.summaries()[0].1, SubscriptionStatus::Replaying);
        reg.mark_live("a");
        assert_eq!(reg.summaries()[0].1, SubscriptionStatus::Live);

        for entry in reg.drain() {
            if let Some(h) = entry.into_handle() {
                h.unsubscribe();
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!t.is_current());
        assert!(reg.summaries().is_empty());
    }
}
