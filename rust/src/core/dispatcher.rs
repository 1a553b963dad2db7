// Coalesces classified events into one flush per tick.
//
// Batches are keyed by surface; within a surface events keep arrival order.
// Cross-surface order is whatever order the surfaces first showed up in.

use std::time::Duration;

use flume::Sender;

use super::classifier::Classification;
use crate::state::{InboundEvent, SurfaceId};
use crate::updates::{CoreMsg, InternalEvent};

/// Timer seam for flushes and replay grace periods.
pub(crate) trait Scheduler: Send {
    fn schedule(&self, delay: Duration, event: InternalEvent);
}

/// Sleeps on the actor's runtime, then posts the event back to the mailbox.
pub(crate) struct TokioScheduler {
    handle: tokio::runtime::Handle,
    tx: Sender<CoreMsg>,
}

impl TokioScheduler {
    pub(crate) fn new(handle: tokio::runtime::Handle, tx: Sender<CoreMsg>) -> Self {
        Self { handle, tx }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, event: InternalEvent) {
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }
}

/// Collects timers instead of running them; tests fire them by hand.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct ManualScheduler {
    timers: std::sync::Arc<std::sync::Mutex<Vec<(Duration, InternalEvent)>>>,
}

#[cfg(test)]
impl ManualScheduler {
    pub(crate) fn take_all(&self) -> Vec<(Duration, InternalEvent)> {
        std::mem::take(&mut *self.timers.lock().unwrap())
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

#[cfg(test)]
impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: InternalEvent) {
        self.timers.lock().unwrap().push((delay, event));
    }
}

#[derive(Clone, Debug)]
pub(super) struct ClassifiedEvent {
    pub(super) event: InboundEvent,
    pub(super) classification: Classification,
}

#[derive(Debug)]
pub(super) struct PendingBatch {
    pub(super) surface_id: SurfaceId,
    pub(super) events: Vec<ClassifiedEvent>,
}

#[derive(Debug, Default)]
pub(super) struct CoalescingDispatcher {
    batches: Vec<PendingBatch>,
    flush_token: u64,
    armed: bool,
}

impl CoalescingDispatcher {
    /// Queues one event. Returns the flush token to schedule when this call
    /// armed a new flush; `None` when one is already pending.
    pub(super) fn enqueue(&mut self, surface_id: &str, event: ClassifiedEvent) -> Option<u64> {
        match self.batches.iter_mut().find(|b| b.surface_id == surface_id) {
            Some(batch) => batch.events.push(event),
            None => self.batches.push(PendingBatch {
                surface_id: surface_id.to_string(),
                events: vec![event],
            }),
        }
        if self.armed {
            return None;
        }
        self.armed = true;
        self.flush_token = self.flush_token.wrapping_add(1);
        Some(self.flush_token)
    }

    /// Drains everything queued. `None` if `token` was cancelled or superseded.
    pub(super) fn take(&mut self, token: u64) -> Option<Vec<PendingBatch>> {
        if !self.armed || token != self.flush_token {
            return None;
        }
        self.armed = false;
        Some(std::mem::take(&mut self.batches))
    }

    /// Drops queued events for one surface. The armed flush stays scheduled.
    pub(super) fn drop_surface(&mut self, surface_id: &str) -> usize {
        let mut dropped = 0;
        self.batches.retain(|b| {
            if b.surface_id == surface_id {
                dropped += b.events.len();
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Cancels the scheduled flush wholesale and discards everything queued.
    pub(super) fn cancel(&mut self) {
        self.batches.clear();
        self.armed = false;
        self.flush_token = self.flush_token.wrapping_add(1);
    }

    #[cfg(test)]
    pub(super) fn pending_len(&self) -> usize {
        self.batches.iter().map(|b| b.events.len()).sum()
    }
}
