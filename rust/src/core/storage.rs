// Per-surface message store + projection of engine state into `AppState`.

use std::collections::{HashMap, HashSet, VecDeque};

use super::*;

/// Accepted events per surface, oldest first, bounded to the newest `max_per_surface`.
/// Kept across untrack so a re-subscribe can re-seed the seen set.
#[derive(Debug)]
pub(super) struct MessageStore {
    max_per_surface: usize,
    surfaces: HashMap<SurfaceId, VecDeque<InboundEvent>>,
}

impl MessageStore {
    pub(super) fn new(max_per_surface: usize) -> Self {
        Self {
            max_per_surface: max_per_surface.max(1),
            surfaces: HashMap::new(),
        }
    }

    pub(super) fn append(&mut self, event: InboundEvent) {
        let list = self.surfaces.entry(event.surface_id.clone()).or_default();
        list.push_back(event);
        while list.len() > self.max_per_surface {
            list.pop_front();
        }
    }

    /// Merges events not already held, each placed at its timestamp position.
    /// Returns how many were added.
    pub(super) fn merge_history(
        &mut self,
        surface_id: &str,
        mut events: Vec<InboundEvent>,
    ) -> usize {
        let list = self.surfaces.entry(surface_id.to_string()).or_default();
        let held: HashSet<&str> = list.iter().map(|e| e.id.as_str()).collect();
        let mut batch_ids: HashSet<String> = HashSet::new();
        events.retain(|e| !held.contains(e.id.as_str()) && batch_ids.insert(e.id.clone()));
        events.sort_by_key(|e| e.timestamp);
        let added = events.len();
        for e in events {
            // Ties go after held events so arrival order wins.
            let pos = list
                .iter()
                .position(|h| h.timestamp > e.timestamp)
                .unwrap_or(list.len());
            list.insert(pos, e);
        }
        while list.len() > self.max_per_surface {
            list.pop_front();
        }
        added
    }

    pub(super) fn ids(&self, surface_id: &str) -> Vec<&str> {
        self.surfaces
            .get(surface_id)
            .map(|l| l.iter().map(|e| e.id.as_str()).collect())
            .unwrap_or_default()
    }

    pub(super) fn messages(&self, surface_id: &str) -> impl Iterator<Item = &InboundEvent> {
        self.surfaces.get(surface_id).into_iter().flatten()
    }

    #[cfg(test)]
    pub(super) fn len(&self, surface_id: &str) -> usize {
        self.surfaces.get(surface_id).map_or(0, VecDeque::len)
    }

    pub(super) fn clear(&mut self) {
        self.surfaces.clear();
    }
}

impl AppCore {
    /// Rebuilds every derived field of `AppState` from engine state. Does not emit.
    pub(super) fn refresh_state(&mut self) {
        let surfaces: Vec<SurfaceSummary> = self
            .registry
            .summaries()
            .into_iter()
            .map(|(d, status)| SurfaceSummary {
                surface_id: d.surface_id.clone(),
                kind: d.kind.clone(),
                last_read_at: d.last_read_at,
                unread_count: self.ledger.get(&d.surface_id),
                mention_count: self.gate.mention_count(&d.surface_id),
                status,
            })
            .collect();
        self.state.unread_total = self.ledger.total();
        self.state.surfaces = surfaces;
        self.state.notifications = self.gate.records().to_vec();
        self.state.unread_notifications = self.gate.unread_count();
        self.state.settings = self.settings.clone();

        let my_id = self.session.as_ref().map(|s| s.user_id.as_str());
        self.state.current_surface = self.open_surface.as_ref().map(|surface_id| {
            SurfaceViewState {
                surface_id: surface_id.clone(),
                messages: self
                    .messages
                    .messages(surface_id)
                    .map(|e| MessageView {
                        id: e.id.clone(),
                        author_id: e.author_id.clone(),
                        timestamp: e.timestamp,
                        content: e.content.clone(),
                        kind: e.kind,
                        is_mine: Some(e.author_id.as_str()) == my_id,
                    })
                    .collect(),
            }
        });
    }
}
