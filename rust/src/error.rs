use thiserror::Error;

/// Failures from the transport collaborator.
///
/// Every variant is transient from the engine's point of view: the surface is
/// left untracked and the next reconcile pass retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("recipient key unavailable for {user_id}: {reason}")]
    KeyResolution { user_id: String, reason: String },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("transport offline")]
    Offline,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Short text suitable for a non-blocking toast.
    pub fn user_message(&self, surface_id: &str) -> String {
        match self {
            TransportError::KeyResolution { .. } => {
                format!("Could not reach {surface_id}: recipient key unavailable")
            }
            TransportError::Offline => format!("Could not reach {surface_id}: offline"),
            TransportError::Subscribe(_) | TransportError::Other(_) => {
                format!("Could not reach {surface_id}")
            }
        }
    }
}

/// Settings/notification persistence failures.
///
/// In-memory state stays authoritative for the session when these occur.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Desktop alert failures. Both variants degrade delivery to in-app only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("desktop notification permission denied")]
    PermissionDenied,
    #[error("desktop notifications unavailable: {0}")]
    Unavailable(String),
}
