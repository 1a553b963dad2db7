// Session lifecycle + subscription side effects.

use super::*;
use crate::collaborators::{GenerationToken, SubscriptionHandle};
use crate::error::{StoreError, TransportError};
use crate::state::NotificationRecord;

impl AppCore {
    pub(super) fn login(&mut self, user_id: String, display_name: String) {
        // Tear down any existing session first.
        self.teardown();
        self.session_token = self.session_token.wrapping_add(1);

        tracing::info!(user_id = %user_id, "start_session");
        self.gate.set_identity(&user_id, &display_name);
        self.state.session = SessionState::Loading {
            user_id: user_id.clone(),
        };
        self.session = Some(Session {
            user_id,
            display_name,
            loaded: false,
            deferred: Vec::new(),
        });

        let store = self.collab.store.clone();
        let tx = self.core_sender.clone();
        let token = self.session_token;
        self.runtime.spawn(async move {
            let settings = store.load_notification_settings().await;
            let records = store.load_persisted_notifications().await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SessionLoaded {
                token,
                settings,
                records,
            })));
        });
        self.emit_state();
    }

    pub(super) fn session_loaded(
        &mut self,
        token: u64,
        settings: Result<NotificationSettings, StoreError>,
        records: Result<Vec<NotificationRecord>, StoreError>,
    ) {
        // Ignore stale results (e.g., logout/login during load).
        if token != self.session_token {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.loaded = true;
        let deferred = std::mem::take(&mut sess.deferred);
        self.state.session = SessionState::Ready {
            user_id: sess.user_id.clone(),
            display_name: sess.display_name.clone(),
        };

        match settings {
            Ok(s) => self.settings = s,
            Err(e) => tracing::warn!(%e, "notification settings unavailable; using defaults"),
        }
        match records {
            Ok(recs) => {
                tracing::info!(count = recs.len(), "persisted notifications loaded");
                self.gate.load_persisted(recs);
            }
            Err(e) => tracing::warn!(%e, "persisted notifications unavailable"),
        }

        for action in deferred {
            self.apply_surface_action(action);
        }
        self.emit_state();
    }

    pub(super) fn logout(&mut self) {
        tracing::info!("stop_session");
        self.teardown();
        self.session_token = self.session_token.wrapping_add(1);
        self.state.session = SessionState::LoggedOut;
        self.state.toast = None;
        self.emit_state();
    }

    /// Process-wide teardown: every surface, every session-scoped cache.
    fn teardown(&mut self) {
        for entry in self.registry.drain() {
            if let Some(handle) = entry.into_handle() {
                handle.unsubscribe();
            }
        }
        self.dispatcher.cancel();
        self.classifier.clear();
        self.key_cache.clear();
        self.gate.reset();
        self.ledger.clear_all();
        self.messages.clear();
        self.open_surface = None;
        self.settings = NotificationSettings::default();
        self.session = None;
    }

    pub(super) fn apply_surface_action(&mut self, action: AppAction) {
        match action {
            AppAction::ReconcileSurfaces { desired } => self.reconcile(desired),
            AppAction::TrackSurface { descriptor } => self.track_surface(descriptor),
            AppAction::UntrackSurface { surface_id } => self.untrack_surface(&surface_id),
            other => tracing::debug!(action = other.tag(), "not a surface action"),
        }
    }

    fn reconcile(&mut self, desired: Vec<SurfaceDescriptor>) {
        let plan = self.registry.reconcile(&desired);
        tracing::debug!(
            track = plan.to_track.len(),
            untrack = plan.to_untrack.len(),
            "reconcile"
        );
        for surface_id in &plan.to_untrack {
            self.untrack_surface(surface_id);
        }
        for (surface_id, at) in plan.read_marks {
            self.registry.set_last_read_at(&surface_id, at);
            self.classifier.set_last_read_at(&surface_id, at);
        }
        for descriptor in plan.to_track {
            self.track_surface(descriptor);
        }
    }

    fn track_surface(&mut self, descriptor: SurfaceDescriptor) {
        let surface_id = descriptor.surface_id.clone();
        let Some(token) = self.registry.track(descriptor.clone()) else {
            tracing::debug!(surface_id = %surface_id, "already tracked");
            return;
        };
        tracing::info!(surface_id = %surface_id, generation = token.generation(), "track");

        // Replay starts now; anything delivered before the grace timer fires is backlog.
        self.classifier.begin(
            &surface_id,
            descriptor.last_read_at,
            self.messages.ids(&surface_id),
        );

        let peer_id = match &descriptor.kind {
            SurfaceKind::Conversation { peer_id } => Some(peer_id.clone()),
            SurfaceKind::Channel { .. } => None,
        };
        let Some(peer_id) = peer_id else {
            self.spawn_subscribe(token, descriptor, None);
            return;
        };
        match self.key_cache.get(&peer_id).cloned() {
            Some(key) => {
                self.registry.mark_subscribing(&surface_id);
                self.spawn_subscribe(token, descriptor, Some(key));
            }
            None => self.spawn_resolve(token, peer_id),
        }
    }

    pub(super) fn untrack_surface(&mut self, surface_id: &str) {
        let Some(entry) = self.registry.untrack(surface_id) else {
            return;
        };
        tracing::info!(surface_id = %surface_id, "untrack");
        if let Some(handle) = entry.into_handle() {
            handle.unsubscribe();
        }
        let dropped = self.dispatcher.drop_surface(surface_id);
        if dropped > 0 {
            tracing::debug!(surface_id = %surface_id, dropped, "pending events dropped");
        }
        // A pending grace timer now carries a stale generation and is ignored.
        self.classifier.end(surface_id);
        self.ledger.remove(surface_id);
        if self.open_surface.as_deref() == Some(surface_id) {
            self.open_surface = None;
        }
    }

    fn spawn_resolve(&mut self, token: GenerationToken, peer_id: String) {
        let transport = self.collab.transport.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = transport.resolve_recipient_key(&peer_id).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::RecipientKeyResolved {
                    surface_id: token.surface_id().to_string(),
                    generation: token.generation(),
                    peer_id,
                    result,
                },
            )));
        });
    }

    fn spawn_subscribe(
        &mut self,
        token: GenerationToken,
        descriptor: SurfaceDescriptor,
        recipient_key: Option<RecipientKey>,
    ) {
        let transport = self.collab.transport.clone();
        let tx = self.core_sender.clone();
        let sink = EventSink::new(token.clone(), self.core_sender.clone());
        let request = SubscribeRequest {
            descriptor,
            recipient_key,
        };
        self.runtime.spawn(async move {
            let result = transport.subscribe(request, sink).await;
            let result = match result {
                Ok(handle) if !token.is_current() => {
                    // Superseded while subscribing; never let it go live.
                    handle.unsubscribe();
                    return;
                }
                other => other,
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SubscriptionOpened {
                surface_id: token.surface_id().to_string(),
                generation: token.generation(),
                result,
            })));
        });
    }

    pub(super) fn recipient_key_resolved(
        &mut self,
        surface_id: &str,
        generation: u64,
        peer_id: String,
        result: Result<RecipientKey, TransportError>,
    ) {
        if !self.registry.is_current(surface_id, generation) {
            tracing::debug!(surface_id = %surface_id, generation, "stale key resolution discarded");
            return;
        }
        match result {
            Ok(key) => {
                self.key_cache.insert(peer_id, key.clone());
                self.registry.mark_subscribing(surface_id);
                let (Some(token), Some(descriptor)) = (
                    self.registry.token(surface_id),
                    self.registry.descriptor(surface_id).cloned(),
                ) else {
                    return;
                };
                self.spawn_subscribe(token, descriptor, Some(key));
                self.emit_state();
            }
            Err(e) => self.subscription_failed(surface_id, e),
        }
    }

    pub(super) fn subscription_opened(
        &mut self,
        surface_id: &str,
        generation: u64,
        result: Result<SubscriptionHandle, TransportError>,
    ) {
        match result {
            Ok(handle) => match self.registry.attach(surface_id, generation, handle) {
                Ok(()) => {
                    tracing::info!(surface_id = %surface_id, generation, "subscribed");
                    self.scheduler.schedule(
                        self.replay_grace,
                        InternalEvent::ReplayGraceElapsed {
                            surface_id: surface_id.to_string(),
                            generation,
                        },
                    );
                    self.emit_state();
                }
                Err(handle) => {
                    tracing::debug!(surface_id = %surface_id, generation, "stale subscription closed");
                    handle.unsubscribe();
                }
            },
            Err(e) => {
                if !self.registry.is_current(surface_id, generation) {
                    return;
                }
                self.subscription_failed(surface_id, e);
            }
        }
    }

    /// Leaves the surface untracked so the next reconcile retries.
    fn subscription_failed(&mut self, surface_id: &str, err: TransportError) {
        tracing::warn!(surface_id = %surface_id, %err, "subscription failed");
        self.registry.fail(surface_id);
        self.classifier.end(surface_id);
        self.dispatcher.drop_surface(surface_id);
        self.toast(err.user_message(surface_id));
    }

    pub(super) fn open_surface(&mut self, surface_id: &str) {
        if !self.registry.contains(surface_id) {
            tracing::debug!(surface_id = %surface_id, "open for untracked surface ignored");
            return;
        }
        let now = now_millis();
        self.ledger.clear(surface_id);
        for rec in self.gate.clear_mentions(surface_id) {
            self.persister.send(PersistOp::SaveRecord(rec));
        }
        self.registry.set_last_read_at(surface_id, now);
        self.classifier.set_last_read_at(surface_id, now);
        self.open_surface = Some(surface_id.to_string());

        // Local clear is authoritative; the remote write is best effort.
        let transport = self.collab.transport.clone();
        let id = surface_id.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = transport.mark_read(&id, now).await {
                tracing::warn!(surface_id = %id, %e, "mark_read failed; keeping local clear");
            }
        });
        self.emit_state();
    }

    pub(super) fn load_history(&mut self, surface_id: &str, limit: u32) {
        let Some(token) = self.registry.token(surface_id) else {
            tracing::debug!(surface_id = %surface_id, "history for untracked surface ignored");
            return;
        };
        let transport = self.collab.transport.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = transport
                .get_history(token.surface_id(), limit as usize)
                .await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryLoaded {
                surface_id: token.surface_id().to_string(),
                generation: token.generation(),
                result,
            })));
        });
    }

    pub(super) fn history_loaded(
        &mut self,
        surface_id: &str,
        generation: u64,
        result: Result<Vec<InboundEvent>, TransportError>,
    ) {
        if !self.registry.is_current(surface_id, generation) {
            tracing::debug!(surface_id = %surface_id, "stale history discarded");
            return;
        }
        match result {
            Ok(mut events) => {
                // Backfill never counts: mark seen and store, nothing else.
                events.retain(|e| e.surface_id == surface_id && self.classifier.mark_seen(&e.id));
                let added = self.messages.merge_history(surface_id, events);
                tracing::debug!(surface_id = %surface_id, added, "history merged");
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(surface_id = %surface_id, %e, "history load failed");
                self.post(InternalEvent::Toast(format!(
                    "Could not load history for {surface_id}"
                )));
            }
        }
    }
}
