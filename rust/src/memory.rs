//! In-process collaborators: a loopback transport, in-memory and JSON-file
//! notification stores, and an alert sink that records what it was asked to show.
//!
//! `MemoryTransport` behaves like the real graph store where it matters: every
//! subscribe replays the surface's whole backlog synchronously, and it can be
//! told to deliver each event over several independent paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::collaborators::{
    AlertSink, DesktopAlert, EventSink, NotificationStore, RecipientKey, SubscribeRequest,
    Subscription, SubscriptionHandle, Transport,
};
use crate::error::{AlertError, StoreError, TransportError};
use crate::policy::NotificationSettings;
use crate::state::{InboundEvent, NotificationRecord, SurfaceId, UserId};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

struct LiveSink {
    id: u64,
    surface_id: SurfaceId,
    sink: EventSink,
}

struct TransportInner {
    backlog: HashMap<SurfaceId, Vec<InboundEvent>>,
    // Older events only reachable through get_history.
    history: HashMap<SurfaceId, Vec<InboundEvent>>,
    sinks: Vec<LiveSink>,
    next_sub: u64,
    paths: usize,
    keys: HashMap<UserId, RecipientKey>,
    held_keys: HashMap<UserId, watch::Sender<bool>>,
    key_failures: HashMap<UserId, TransportError>,
    subscribe_failures: HashMap<SurfaceId, TransportError>,
    subscribe_calls: HashMap<SurfaceId, usize>,
    marked_read: Vec<(SurfaceId, i64)>,
    fail_mark_read: bool,
}

impl Default for TransportInner {
    fn default() -> Self {
        Self {
            backlog: HashMap::new(),
            history: HashMap::new(),
            sinks: Vec::new(),
            next_sub: 0,
            paths: 1,
            keys: HashMap::new(),
            held_keys: HashMap::new(),
            key_failures: HashMap::new(),
            subscribe_failures: HashMap::new(),
            subscribe_calls: HashMap::new(),
            marked_read: Vec::new(),
            fail_mark_read: false,
        }
    }
}

/// Loopback transport. Cloning shares the same underlying network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events to the backlog replayed on every subscribe.
    pub fn seed_backlog(&self, surface_id: &str, events: Vec<InboundEvent>) {
        lock(&self.inner)
            .backlog
            .entry(surface_id.to_string())
            .or_default()
            .extend(events);
    }

    /// Events only returned by `get_history`, never replayed.
    pub fn seed_history(&self, surface_id: &str, events: Vec<InboundEvent>) {
        lock(&self.inner)
            .history
            .entry(surface_id.to_string())
            .or_default()
            .extend(events);
    }

    /// Appends to the backlog and pushes to every live subscriber of the
    /// event's surface. Returns how many deliveries were accepted.
    pub fn publish(&self, event: InboundEvent) -> usize {
        let (sinks, paths) = {
            let mut inner = lock(&self.inner);
            inner
                .backlog
                .entry(event.surface_id.clone())
                .or_default()
                .push(event.clone());
            let sinks: Vec<EventSink> = inner
                .sinks
                .iter()
                .filter(|s| s.surface_id == event.surface_id)
                .map(|s| s.sink.clone())
                .collect();
            (sinks, inner.paths)
        };
        let mut delivered = 0;
        for sink in &sinks {
            for _ in 0..paths {
                if sink.deliver(event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Every event is delivered this many times per subscription.
    pub fn set_delivery_paths(&self, paths: usize) {
        lock(&self.inner).paths = paths.max(1);
    }

    pub fn set_key(&self, user_id: &str, key: RecipientKey) {
        lock(&self.inner).keys.insert(user_id.to_string(), key);
    }

    /// Key resolution for `user_id` blocks until `release_key`.
    pub fn hold_key(&self, user_id: &str) {
        let (tx, _rx) = watch::channel(false);
        lock(&self.inner).held_keys.insert(user_id.to_string(), tx);
    }

    pub fn release_key(&self, user_id: &str) {
        if let Some(tx) = lock(&self.inner).held_keys.remove(user_id) {
            let _ = tx.send(true);
        }
    }

    pub fn fail_key(&self, user_id: &str, err: TransportError) {
        lock(&self.inner).key_failures.insert(user_id.to_string(), err);
    }

    pub fn fail_subscribe(&self, surface_id: &str, err: TransportError) {
        lock(&self.inner)
            .subscribe_failures
            .insert(surface_id.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut inner = lock(&self.inner);
        inner.key_failures.clear();
        inner.subscribe_failures.clear();
    }

    pub fn fail_mark_read(&self, fail: bool) {
        lock(&self.inner).fail_mark_read = fail;
    }

    pub fn active_subscriptions(&self, surface_id: &str) -> usize {
        lock(&self.inner)
            .sinks
            .iter()
            .filter(|s| s.surface_id == surface_id)
            .count()
    }

    pub fn subscribe_calls(&self, surface_id: &str) -> usize {
        lock(&self.inner)
            .subscribe_calls
            .get(surface_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn marked_read(&self) -> Vec<(SurfaceId, i64)> {
        lock(&self.inner).marked_read.clone()
    }
}

struct MemorySubscription {
    id: u64,
    inner: Weak<Mutex<TransportInner>>,
}

impl Subscription for MemorySubscription {
    fn unsubscribe(self: Box<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner).sinks.retain(|s| s.id != self.id);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sink: EventSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let surface_id = request.descriptor.surface_id.clone();
        let (id, backlog, paths) = {
            let mut inner = lock(&self.inner);
            *inner.subscribe_calls.entry(surface_id.clone()).or_insert(0) += 1;
            if let Some(err) = inner.subscribe_failures.get(&surface_id) {
                return Err(err.clone());
            }
            if request.descriptor.kind.is_conversation() && request.recipient_key.is_none() {
                return Err(TransportError::Subscribe(
                    "conversation without recipient key".into(),
                ));
            }
            inner.next_sub += 1;
            let id = inner.next_sub;
            inner.sinks.push(LiveSink {
                id,
                surface_id: surface_id.clone(),
                sink: sink.clone(),
            });
            let backlog = inner.backlog.get(&surface_id).cloned().unwrap_or_default();
            (id, backlog, inner.paths)
        };

        // Dump the local backlog immediately, with no end-of-history marker.
        for _ in 0..paths {
            for event in &backlog {
                sink.deliver(event.clone());
            }
        }

        Ok(SubscriptionHandle::new(MemorySubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    async fn get_history(
        &self,
        surface_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, TransportError> {
        let inner = lock(&self.inner);
        let mut all: Vec<InboundEvent> = inner
            .history
            .get(surface_id)
            .into_iter()
            .chain(inner.backlog.get(surface_id))
            .flatten()
            .cloned()
            .collect();
        all.sort_by_key(|e| e.timestamp);
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    async fn resolve_recipient_key(&self, user_id: &str) -> Result<RecipientKey, TransportError> {
        let held = lock(&self.inner)
            .held_keys
            .get(user_id)
            .map(|tx| tx.subscribe());
        if let Some(mut rx) = held {
            let _ = rx.wait_for(|released| *released).await;
        }
        let inner = lock(&self.inner);
        if let Some(err) = inner.key_failures.get(user_id) {
            return Err(err.clone());
        }
        Ok(inner
            .keys
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| RecipientKey(format!("key:{user_id}"))))
    }

    async fn mark_read(&self, surface_id: &str, read_at: i64) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner.marked_read.push((surface_id.to_string(), read_at));
        if inner.fail_mark_read {
            return Err(TransportError::Offline);
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    settings: NotificationSettings,
    records: Vec<NotificationRecord>,
    fail_writes: bool,
    writes: usize,
}

/// Notification store held in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn seed_settings(&self, settings: NotificationSettings) {
        lock(&self.inner).settings = settings;
    }

    pub fn seed_records(&self, records: Vec<NotificationRecord>) {
        lock(&self.inner).records = records;
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.inner).fail_writes = fail;
    }

    pub fn settings(&self) -> NotificationSettings {
        lock(&self.inner).settings.clone()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        lock(&self.inner).records.clone()
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        lock(&self.inner).writes
    }

    fn write(&self, f: impl FnOnce(&mut StoreInner)) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        f(&mut inner);
        inner.writes += 1;
        Ok(())
    }
}

fn upsert(records: &mut Vec<NotificationRecord>, record: &NotificationRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn load_notification_settings(&self) -> Result<NotificationSettings, StoreError> {
        Ok(self.settings())
    }

    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<(), StoreError> {
        self.write(|inner| inner.settings = settings.clone())
    }

    async fn load_persisted_notifications(&self) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(self.records())
    }

    async fn save_notification_record(
        &self,
        record: &NotificationRecord,
    ) -> Result<(), StoreError> {
        self.write(|inner| upsert(&mut inner.records, record))
    }

    async fn delete_notification_record(&self, id: &str) -> Result<(), StoreError> {
        self.write(|inner| inner.records.retain(|r| r.id != id))
    }
}

const SETTINGS_FILE: &str = "notification_settings.json";
const RECORDS_FILE: &str = "notifications.json";

/// Settings and records as JSON files under a directory. Writes go to a
/// temp file first and are renamed into place.
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the records file.
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        name: &str,
    ) -> Result<T, StoreError> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for JsonFileStore {
    async fn load_notification_settings(&self) -> Result<NotificationSettings, StoreError> {
        self.read_json(SETTINGS_FILE).await
    }

    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.write_json(SETTINGS_FILE, settings).await
    }

    async fn load_persisted_notifications(&self) -> Result<Vec<NotificationRecord>, StoreError> {
        self.read_json(RECORDS_FILE).await
    }

    async fn save_notification_record(
        &self,
        record: &NotificationRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records: Vec<NotificationRecord> = self.read_json(RECORDS_FILE).await?;
        upsert(&mut records, record);
        self.write_json(RECORDS_FILE, &records).await
    }

    async fn delete_notification_record(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records: Vec<NotificationRecord> = self.read_json(RECORDS_FILE).await?;
        records.retain(|r| r.id != id);
        self.write_json(RECORDS_FILE, &records).await
    }
}

/// Alert sink that records alerts instead of showing them.
#[derive(Default)]
pub struct RecordingAlerts {
    desktop: Mutex<Vec<DesktopAlert>>,
    sounds: AtomicUsize,
    denied: AtomicUsize,
    deny_permission: AtomicBool,
}

impl RecordingAlerts {
    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn desktop_alerts(&self) -> Vec<DesktopAlert> {
        lock(&self.desktop).clone()
    }

    pub fn sound_count(&self) -> usize {
        self.sounds.load(Ordering::SeqCst)
    }

    pub fn denied_count(&self) -> usize {
        self.denied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn show_desktop(&self, alert: DesktopAlert) -> Result<(), AlertError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            self.denied.fetch_add(1, Ordering::SeqCst);
            return Err(AlertError::PermissionDenied);
        }
        lock(&self.desktop).push(alert);
        Ok(())
    }

    async fn play_sound(&self) {
        self.sounds.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NotificationType, SurfaceDescriptor};

    fn record(id: &str, message_id: &str) -> NotificationRecord {
        NotificationRecord {
            id: id.into(),
            message_id: message_id.into(),
            surface_id: "general".into(),
            notification_type: NotificationType::Mention,
            sender_id: "bob".into(),
            preview: "@alice".into(),
            timestamp: 1,
            read: false,
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_and_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_persisted_notifications().await.unwrap().is_empty());
        assert_eq!(
            store.load_notification_settings().await.unwrap(),
            NotificationSettings::default()
        );

        store.save_notification_record(&record("n1", "m1")).await.unwrap();
        let mut read = record("n1", "m1");
        read.read = true;
        store.save_notification_record(&read).await.unwrap();
        store.save_notification_record(&record("n2", "m2")).await.unwrap();
        store.delete_notification_record("n2").await.unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let recs = reopened.load_persisted_notifications().await.unwrap();
        assert_eq!(recs, vec![read]);
        assert!(!dir.path().join("notifications.tmp").exists());

        let mut settings = NotificationSettings::default();
        settings.global.sound_enabled = false;
        store.save_notification_settings(&settings).await.unwrap();
        assert_eq!(reopened.load_notification_settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn json_store_reports_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RECORDS_FILE), b"{broken").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load_persisted_notifications().await,
            Err(StoreError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_write_failures() {
        let store = MemoryStore::default();
        store.fail_writes(true);
        assert!(store.save_notification_record(&record("n1", "m1")).await.is_err());
        store.fail_writes(false);
        store.save_notification_record(&record("n1", "m1")).await.unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn history_returns_newest_within_limit() {
        let t = MemoryTransport::new();
        t.seed_history("general", vec![InboundEvent::text("h1", "general", "bob", 1, "a")]);
        t.seed_backlog("general", vec![InboundEvent::text("b1", "general", "bob", 5, "b")]);
        let got = t.get_history("general", 1).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "b1");
        assert_eq!(t.get_history("general", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn conversation_subscribe_requires_key() {
        let t = MemoryTransport::new();
        let (tx, _rx) = flume::unbounded();
        let current = Arc::new(std::sync::atomic::AtomicU64::new(1));
        let sink = EventSink::new(
            crate::collaborators::GenerationToken::new("dm:bob".into(), 1, current),
            tx,
        );
        let req = SubscribeRequest {
            descriptor: SurfaceDescriptor::conversation("dm:bob", "bob"),
            recipient_key: None,
        };
        assert!(t.subscribe(req, sink).await.is_err());
        assert_eq!(t.subscribe_calls("dm:bob"), 1);
        assert_eq!(t.active_subscriptions("dm:bob"), 0);
    }

    #[tokio::test]
    async fn recording_alerts_honour_permission() {
        let alerts = RecordingAlerts::default();
        let alert = DesktopAlert {
            title: "t".into(),
            body: "b".into(),
            surface_id: "general".into(),
            message_id: "m1".into(),
        };
        alerts.deny_permission(true);
        assert_eq!(
            alerts.show_desktop(alert.clone()).await,
            Err(AlertError::PermissionDenied)
        );
        alerts.deny_permission(false);
        alerts.show_desktop(alert).await.unwrap();
        alerts.play_sound().await;
        assert_eq!(alerts.desktop_alerts().len(), 1);
        assert_eq!(alerts.sound_count(), 1);
        assert_eq!(alerts.denied_count(), 1);
    }
}
