// Fire-and-forget persistence. Local state is already updated when an op is
// queued; a failed write is logged and never rolled back. One worker task
// drains the queue so writes land in the order they were issued.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::collaborators::NotificationStore;
use crate::policy::NotificationSettings;
use crate::state::NotificationRecord;

#[derive(Debug)]
pub(super) enum PersistOp {
    SaveRecord(NotificationRecord),
    DeleteRecord(String),
    SaveSettings(NotificationSettings),
}

impl PersistOp {
    fn tag(&self) -> &'static str {
        match self {
            PersistOp::SaveRecord(_) => "SaveRecord",
            PersistOp::DeleteRecord(_) => "DeleteRecord",
            PersistOp::SaveSettings(_) => "SaveSettings",
        }
    }
}

pub(super) struct Persister {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl Persister {
    pub(super) fn start(
        handle: &tokio::runtime::Handle,
        store: Arc<dyn NotificationStore>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        handle.spawn(async move {
            while let Some(op) = rx.recv().await {
                let tag = op.tag();
                let res = match &op {
                    PersistOp::SaveRecord(rec) => store.save_notification_record(rec).await,
                    PersistOp::DeleteRecord(id) => store.delete_notification_record(id).await,
                    PersistOp::SaveSettings(s) => store.save_notification_settings(s).await,
                };
                match res {
                    Ok(()) => tracing::debug!(op = tag, "persisted"),
                    Err(e) => {
                        tracing::warn!(op = tag, %e, "persist failed; in-memory state stays authoritative")
                    }
                }
            }
        });
        Self { tx }
    }

    pub(super) fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("persistence worker gone");
        }
    }
}
