use crate::collaborators::{RecipientKey, SubscriptionHandle};
use crate::error::{StoreError, TransportError};
use crate::policy::NotificationSettings;
use crate::state::{AppState, InboundEvent, NotificationRecord};
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    NotificationDelivered {
        rev: u64,
        record: NotificationRecord,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::NotificationDelivered { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Session bootstrap
    SessionLoaded {
        token: u64,
        settings: Result<NotificationSettings, StoreError>,
        records: Result<Vec<NotificationRecord>, StoreError>,
    },

    // Subscription lifecycle. Every result carries the generation it was
    // started under; results for superseded generations are discarded.
    RecipientKeyResolved {
        surface_id: String,
        generation: u64,
        peer_id: String,
        result: Result<RecipientKey, TransportError>,
    },
    SubscriptionOpened {
        surface_id: String,
        generation: u64,
        result: Result<SubscriptionHandle, TransportError>,
    },
    HistoryLoaded {
        surface_id: String,
        generation: u64,
        result: Result<Vec<InboundEvent>, TransportError>,
    },

    // Receive path
    EventReceived {
        surface_id: String,
        generation: u64,
        event: InboundEvent,
    },

    // Timers
    ReplayGraceElapsed {
        surface_id: String,
        generation: u64,
    },
    FlushDue {
        token: u64,
    },

    Toast(String),
}
