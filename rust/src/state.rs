use serde::{Deserialize, Serialize};

use crate::policy::NotificationSettings;

/// Identifies a channel or a one-to-one conversation.
pub type SurfaceId = String;
pub type UserId = String;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurfaceKind {
    Channel { node_id: String },
    Conversation { peer_id: UserId },
}

impl SurfaceKind {
    pub fn is_conversation(&self) -> bool {
        matches!(self, SurfaceKind::Conversation { .. })
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            SurfaceKind::Channel { node_id } => Some(node_id.as_str()),
            SurfaceKind::Conversation { .. } => None,
        }
    }
}

/// What the caller wants tracked. `last_read_at` is unix milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceDescriptor {
    pub surface_id: SurfaceId,
    pub kind: SurfaceKind,
    pub last_read_at: i64,
}

impl SurfaceDescriptor {
    pub fn channel(surface_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            kind: SurfaceKind::Channel {
                node_id: node_id.into(),
            },
            last_read_at: 0,
        }
    }

    pub fn conversation(surface_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            kind: SurfaceKind::Conversation {
                peer_id: peer_id.into(),
            },
            last_read_at: 0,
        }
    }

    pub fn with_last_read_at(mut self, last_read_at: i64) -> Self {
        self.last_read_at = last_read_at;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    System,
    File,
}

/// A decrypted, authenticated message as delivered by the transport.
/// Immutable once observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub surface_id: SurfaceId,
    pub author_id: UserId,
    pub timestamp: i64,
    pub content: String,
    pub kind: EventKind,
}

impl InboundEvent {
    pub fn text(
        id: impl Into<String>,
        surface_id: impl Into<String>,
        author_id: impl Into<String>,
        timestamp: i64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            surface_id: surface_id.into(),
            author_id: author_id.into(),
            timestamp,
            content: content.into(),
            kind: EventKind::Text,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Mention,
    Everyone,
    Here,
    Dm,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub message_id: String,
    pub surface_id: SurfaceId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub sender_id: UserId,
    pub preview: String,
    pub timestamp: i64,
    pub read: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Resolving,
    Subscribing,
    Replaying,
    Live,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SurfaceSummary {
    pub surface_id: SurfaceId,
    pub kind: SurfaceKind,
    pub last_read_at: i64,
    pub unread_count: u32,
    pub mention_count: u32,
    pub status: SubscriptionStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: String,
    pub author_id: UserId,
    pub timestamp: i64,
    pub content: String,
    pub kind: EventKind,
    pub is_mine: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SurfaceViewState {
    pub surface_id: SurfaceId,
    pub messages: Vec<MessageView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    Loading { user_id: UserId },
    Ready { user_id: UserId, display_name: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct AppState {
    pub rev: u64,
    pub session: SessionState,
    pub surfaces: Vec<SurfaceSummary>,
    /// Navigation badge; always the sum of `surfaces[..].unread_count`.
    pub unread_total: u32,
    /// Newest first.
    pub notifications: Vec<NotificationRecord>,
    pub unread_notifications: u32,
    pub current_surface: Option<SurfaceViewState>,
    pub settings: NotificationSettings,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            session: SessionState::LoggedOut,
            surfaces: vec![],
            unread_total: 0,
            notifications: vec![],
            unread_notifications: 0,
            current_surface: None,
            settings: NotificationSettings::default(),
            toast: None,
        }
    }

    pub fn unread_for(&self, surface_id: &str) -> u32 {
        self.surfaces
            .iter()
            .find(|s| s.surface_id == surface_id)
            .map(|s| s.unread_count)
            .unwrap_or(0)
    }

    pub fn surface(&self, surface_id: &str) -> Option<&SurfaceSummary> {
        self.surfaces.iter().find(|s| s.surface_id == surface_id)
    }
}

/// Unix time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
