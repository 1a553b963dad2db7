use crate::policy::NotificationSettings;
use crate::state::SurfaceDescriptor;

#[derive(Debug, Clone)]
pub enum AppAction {
    // Session
    Login {
        user_id: String,
        display_name: String,
    },
    Logout,

    // Surface lifecycle
    ReconcileSurfaces {
        desired: Vec<SurfaceDescriptor>,
    },
    TrackSurface {
        descriptor: SurfaceDescriptor,
    },
    UntrackSurface {
        surface_id: String,
    },

    // Navigation
    OpenSurface {
        surface_id: String,
    },
    LoadHistory {
        surface_id: String,
        limit: u32,
    },

    // Notifications
    MarkNotificationRead {
        id: String,
    },
    MarkAllNotificationsRead,
    ClearNotification {
        id: String,
    },
    UpdateNotificationSettings {
        settings: NotificationSettings,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes message content or identifiers).
    pub fn tag(&self) -> &'static str {
        match self {
            // Session
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",

            // Surface lifecycle
            AppAction::ReconcileSurfaces { .. } => "ReconcileSurfaces",
            AppAction::TrackSurface { .. } => "TrackSurface",
            AppAction::UntrackSurface { .. } => "UntrackSurface",

            // Navigation
            AppAction::OpenSurface { .. } => "OpenSurface",
            AppAction::LoadHistory { .. } => "LoadHistory",

            // Notifications
            AppAction::MarkNotificationRead { .. } => "MarkNotificationRead",
            AppAction::MarkAllNotificationsRead => "MarkAllNotificationsRead",
            AppAction::ClearNotification { .. } => "ClearNotification",
            AppAction::UpdateNotificationSettings { .. } => "UpdateNotificationSettings",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}
