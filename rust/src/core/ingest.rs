// Receive path: sink -> classifier -> dispatcher -> (flush) -> store, ledger, gate.

use super::notify::Delivery;
use super::*;
use crate::error::AlertError;

impl AppCore {
    pub(super) fn event_received(&mut self, surface_id: &str, generation: u64, event: InboundEvent) {
        // Stale deliveries never reach the seen set.
        if !self.registry.is_current(surface_id, generation) {
            tracing::debug!(surface_id = %surface_id, generation, "stale delivery dropped");
            return;
        }
        if event.surface_id != surface_id {
            tracing::warn!(surface_id = %surface_id, "event for another surface dropped");
            return;
        }
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        match self.classifier.classify(surface_id, &event, &sess.user_id) {
            Verdict::Duplicate => {
                tracing::debug!(surface_id = %surface_id, id = %event.id, "duplicate dropped");
            }
            Verdict::Accepted(classification) => {
                let queued = ClassifiedEvent {
                    event,
                    classification,
                };
                if let Some(token) = self.dispatcher.enqueue(surface_id, queued) {
                    self.scheduler
                        .schedule(self.flush_interval, InternalEvent::FlushDue { token });
                }
            }
        }
    }

    pub(super) fn flush(&mut self, token: u64) {
        let Some(batches) = self.dispatcher.take(token) else {
            tracing::debug!(token, "cancelled flush ignored");
            return;
        };
        if batches.is_empty() {
            return;
        }
        let Some(self_id) = self.self_id().map(ToString::to_string) else {
            return;
        };
        let now = Instant::now();
        let mut deliveries = Vec::new();
        let mut applied = 0usize;
        for batch in batches {
            let Some(descriptor) = self.registry.descriptor(&batch.surface_id).cloned() else {
                continue;
            };
            let viewing = self.collab.active_view.is_surface_active(&batch.surface_id);
            for queued in batch.events {
                applied += 1;
                if let Some(d) = self.apply_event(&descriptor, queued, &self_id, viewing, now) {
                    deliveries.push(d);
                }
            }
        }
        tracing::debug!(applied, delivered = deliveries.len(), "flush");
        for d in deliveries {
            self.deliver_notification(d);
        }
        self.emit_state();
    }

    fn apply_event(
        &mut self,
        descriptor: &SurfaceDescriptor,
        queued: ClassifiedEvent,
        self_id: &str,
        viewing: bool,
        now: Instant,
    ) -> Option<Delivery> {
        let ClassifiedEvent {
            event,
            classification,
        } = queued;
        // Replay events were counted provisionally by the classifier.
        if classification == Classification::Live && event.author_id != self_id && !viewing {
            self.ledger.increment(&descriptor.surface_id);
        }
        let outcome = self.gate.offer(
            &self.settings,
            GateInput {
                event: &event,
                kind: &descriptor.kind,
                classification,
                last_read_at: descriptor.last_read_at,
                viewing,
            },
            now,
        );
        let id = event.id.clone();
        self.messages.append(event);
        match outcome {
            GateOutcome::Delivered(d) => return Some(d),
            GateOutcome::PolicyGated(reason) => {
                tracing::debug!(id = %id, ?reason, "notification gated by policy");
            }
            GateOutcome::Suppressed => tracing::debug!(id = %id, "notification already exists"),
            GateOutcome::Irrelevant | GateOutcome::AlreadyRead => {}
        }
        None
    }

    fn deliver_notification(&mut self, delivery: Delivery) {
        let Delivery {
            record,
            desktop,
            sound,
        } = delivery;
        tracing::info!(
            surface_id = %record.surface_id,
            kind = ?record.notification_type,
            desktop = desktop.is_some(),
            sound,
            "notification delivered"
        );
        self.persister.send(PersistOp::SaveRecord(record.clone()));

        if desktop.is_some() || sound {
            let alerts = self.collab.alerts.clone();
            self.runtime.spawn(async move {
                if let Some(alert) = desktop {
                    match alerts.show_desktop(alert).await {
                        Ok(()) => {}
                        Err(AlertError::PermissionDenied) => {
                            tracing::debug!("desktop permission denied; in-app only");
                        }
                        Err(e) => tracing::warn!(%e, "desktop alert failed; in-app only"),
                    }
                }
                if sound {
                    alerts.play_sound().await;
                }
            });
        }
        self.emit_notification(record);
    }

    pub(super) fn replay_grace_elapsed(&mut self, surface_id: &str, generation: u64) {
        if !self.registry.is_current(surface_id, generation) {
            tracing::debug!(surface_id = %surface_id, generation, "stale grace timer ignored");
            return;
        }
        let Some(provisional) = self.classifier.commit(surface_id) else {
            return;
        };
        self.registry.mark_live(surface_id);
        if self.collab.active_view.is_surface_active(surface_id) {
            tracing::debug!(surface_id = %surface_id, provisional, "replay count dropped while viewing");
        } else if provisional > 0 {
            let total = self.ledger.commit_replay(surface_id, provisional);
            tracing::debug!(surface_id = %surface_id, provisional, total, "replay count committed");
        }
        tracing::info!(surface_id = %surface_id, "live");
        self.emit_state();
    }
}
