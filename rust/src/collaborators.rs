//! Narrow interfaces to the systems this engine consumes: the message
//! transport, the settings/notification store, the navigation view and the
//! desktop alert surface.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use flume::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, StoreError, TransportError};
use crate::policy::NotificationSettings;
use crate::state::{InboundEvent, NotificationRecord, SurfaceDescriptor, SurfaceId};
use crate::updates::{CoreMsg, InternalEvent};

/// Opaque key material for a conversation recipient.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey(pub String);

impl fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        f.write_str("RecipientKey(..)")
    }
}

/// A subscription generation captured at `track` time.
///
/// The surface's live generation is shared; `is_current` turns false as soon
/// as the surface is re-tracked or untracked.
#[derive(Clone)]
pub struct GenerationToken {
    surface_id: SurfaceId,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl GenerationToken {
    pub(crate) fn new(surface_id: SurfaceId, generation: u64, current: Arc<AtomicU64>) -> Self {
        Self {
            surface_id,
            generation,
            current,
        }
    }

    pub fn surface_id(&self) -> &str {
        &self.surface_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

impl fmt::Debug for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationToken")
            .field("surface_id", &self.surface_id)
            .field("generation", &self.generation)
            .field("current", &self.is_current())
            .finish()
    }
}

/// Handler passed to `Transport::subscribe`.
///
/// Cloneable so a transport can deliver over several independent paths; the
/// engine deduplicates by event id.
#[derive(Clone)]
pub struct EventSink {
    token: GenerationToken,
    tx: Sender<CoreMsg>,
}

impl EventSink {
    pub(crate) fn new(token: GenerationToken, tx: Sender<CoreMsg>) -> Self {
        Self { token, tx }
    }

    pub fn surface_id(&self) -> &str {
        self.token.surface_id()
    }

    /// Hands one event to the engine. Returns false once the subscription
    /// this sink belongs to has been superseded or the engine is gone.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        if !self.token.is_current() {
            return false;
        }
        self.tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::EventReceived {
                surface_id: self.token.surface_id().to_string(),
                generation: self.token.generation(),
                event,
            })))
            .is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("token", &self.token).finish()
    }
}

/// Explicit cancellation handle for a live subscription.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

pub struct SubscriptionHandle(Box<dyn Subscription>);

impl SubscriptionHandle {
    pub fn new(inner: impl Subscription + 'static) -> Self {
        Self(Box::new(inner))
    }

    pub fn unsubscribe(self) {
        self.0.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionHandle(..)")
    }
}

#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub descriptor: SurfaceDescriptor,
    /// Present for conversations only.
    pub recipient_key: Option<RecipientKey>,
}

/// The message/presence transport. Treated as a black box that replays its
/// local backlog into the sink on every subscribe.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
        sink: EventSink,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn get_history(
        &self,
        surface_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, TransportError>;

    async fn resolve_recipient_key(&self, user_id: &str) -> Result<RecipientKey, TransportError>;

    /// Persist read-state remotely. Best effort.
    async fn mark_read(&self, surface_id: &str, read_at: i64) -> Result<(), TransportError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn load_notification_settings(&self) -> Result<NotificationSettings, StoreError>;
    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<(), StoreError>;
    async fn load_persisted_notifications(&self) -> Result<Vec<NotificationRecord>, StoreError>;
    /// Insert or replace by record id.
    async fn save_notification_record(&self, record: &NotificationRecord)
        -> Result<(), StoreError>;
    async fn delete_notification_record(&self, id: &str) -> Result<(), StoreError>;
}

/// Owned by navigation; the engine only reads it.
pub trait ActiveView: Send + Sync {
    fn active_surface_id(&self) -> Option<SurfaceId>;

    fn is_surface_active(&self, surface_id: &str) -> bool {
        self.active_surface_id().as_deref() == Some(surface_id)
    }
}

/// Shared navigation handle: the UI writes it, the engine reads it.
#[derive(Clone, Debug, Default)]
pub struct NavigationState {
    active: Arc<RwLock<Option<SurfaceId>>>,
}

impl NavigationState {
    pub fn set_active(&self, surface_id: Option<&str>) {
        let next = surface_id.map(ToString::to_string);
        match self.active.write() {
            Ok(mut g) => *g = next,
            Err(poison) => *poison.into_inner() = next,
        }
    }
}

impl ActiveView for NavigationState {
    fn active_surface_id(&self) -> Option<SurfaceId> {
        match self.active.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesktopAlert {
    pub title: String,
    pub body: String,
    pub surface_id: SurfaceId,
    pub message_id: String,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// May suspend on a permission prompt.
    async fn show_desktop(&self, alert: DesktopAlert) -> Result<(), AlertError>;
    async fn play_sound(&self);
}

/// Everything the engine is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn NotificationStore>,
    pub active_view: Arc<dyn ActiveView>,
    pub alerts: Arc<dyn AlertSink>,
}
