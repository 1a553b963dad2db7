mod classifier;
mod config;
mod dispatcher;
mod ingest;
mod ledger;
mod notify;
mod persist;
mod registry;
mod session;
mod storage;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use flume::Sender;

use crate::actions::AppAction;
use crate::collaborators::{Collaborators, EventSink, RecipientKey, SubscribeRequest};
use crate::policy::NotificationSettings;
use crate::state::{
    now_millis, AppState, InboundEvent, MessageView, SessionState, SurfaceDescriptor, SurfaceId,
    SurfaceKind, SurfaceSummary, SurfaceViewState, UserId,
};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use classifier::{Classification, ReplayClassifier, Verdict};
use dispatcher::{ClassifiedEvent, CoalescingDispatcher, Scheduler, TokioScheduler};
use ledger::UnreadLedger;
use notify::{GateInput, GateOutcome, NotificationGate};
use persist::{PersistOp, Persister};
use registry::SurfaceRegistry;
use storage::MessageStore;

pub(crate) use config::{default_app_config_json, CONFIG_FILE};

struct Session {
    user_id: UserId,
    display_name: String,
    /// Settings and persisted records have arrived.
    loaded: bool,
    /// Surface actions received before `loaded`; replayed in order.
    deferred: Vec<AppAction>,
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    runtime: tokio::runtime::Runtime,
    scheduler: Box<dyn Scheduler>,
    collab: Collaborators,
    persister: Persister,

    replay_grace: Duration,
    flush_interval: Duration,

    session: Option<Session>,
    // Bumped on every login/logout; stale SessionLoaded results are dropped.
    session_token: u64,
    settings: NotificationSettings,
    key_cache: HashMap<UserId, RecipientKey>,
    open_surface: Option<SurfaceId>,

    registry: SurfaceRegistry,
    classifier: ReplayClassifier,
    dispatcher: CoalescingDispatcher,
    ledger: UnreadLedger,
    gate: NotificationGate,
    messages: MessageStore,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        collab: Collaborators,
    ) -> Self {
        let config = config::load_app_config(&data_dir);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("tokio runtime");

        let scheduler = Box::new(TokioScheduler::new(
            runtime.handle().clone(),
            core_sender.clone(),
        ));
        let persister = Persister::start(runtime.handle(), collab.store.clone());

        tracing::info!(
            data_dir = %data_dir,
            replay_grace_ms = config.replay_grace().as_millis() as u64,
            flush_interval_ms = config.flush_interval().as_millis() as u64,
            "core starting"
        );

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            runtime,
            scheduler,
            collab,
            persister,
            replay_grace: config.replay_grace(),
            flush_interval: config.flush_interval(),
            session: None,
            session_token: 0,
            settings: NotificationSettings::default(),
            key_cache: HashMap::new(),
            open_surface: None,
            registry: SurfaceRegistry::default(),
            classifier: ReplayClassifier::default(),
            dispatcher: CoalescingDispatcher::default(),
            ledger: UnreadLedger::default(),
            gate: NotificationGate::new(
                config.sound_debounce(),
                config.preview_chars(),
                config.alert_on_replay(),
            ),
            messages: MessageStore::new(config.max_messages_per_surface()),
        };

        // Ensure NodesApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    #[cfg(test)]
    fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        self.scheduler = scheduler;
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.refresh_state();
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_notification(&mut self, record: crate::state::NotificationRecord) {
        // The snapshot committed under this rev must already hold the record.
        self.refresh_state();
        let rev = self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self
            .update_sender
            .send(AppUpdate::NotificationDelivered { rev, record });
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Kept in state until the UI clears it, so a resync still shows it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn post(&self, event: InternalEvent) {
        let _ = self.core_sender.send(CoreMsg::Internal(Box::new(event)));
    }

    fn self_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: it carries user ids and settings.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::SessionLoaded {
                token,
                settings,
                records,
            } => self.session_loaded(token, settings, records),
            InternalEvent::RecipientKeyResolved {
                surface_id,
                generation,
                peer_id,
                result,
            } => self.recipient_key_resolved(&surface_id, generation, peer_id, result),
            InternalEvent::SubscriptionOpened {
                surface_id,
                generation,
                result,
            } => self.subscription_opened(&surface_id, generation, result),
            InternalEvent::HistoryLoaded {
                surface_id,
                generation,
                result,
            } => self.history_loaded(&surface_id, generation, result),
            InternalEvent::EventReceived {
                surface_id,
                generation,
                event,
            } => self.event_received(&surface_id, generation, event),
            InternalEvent::ReplayGraceElapsed {
                surface_id,
                generation,
            } => self.replay_grace_elapsed(&surface_id, generation),
            InternalEvent::FlushDue { token } => self.flush(token),
            InternalEvent::Toast(msg) => {
                tracing::info!(msg = %msg, "toast");
                self.toast(msg);
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Session
            AppAction::Login {
                user_id,
                display_name,
            } => self.login(user_id, display_name),
            AppAction::Logout => self.logout(),

            // Surface lifecycle
            action @ (AppAction::ReconcileSurfaces { .. }
            | AppAction::TrackSurface { .. }
            | AppAction::UntrackSurface { .. }) => {
                let Some(sess) = self.session.as_mut() else {
                    tracing::debug!(action = action.tag(), "ignored while logged out");
                    return;
                };
                if !sess.loaded {
                    sess.deferred.push(action);
                    return;
                }
                self.apply_surface_action(action);
                self.emit_state();
            }

            // Navigation
            AppAction::OpenSurface { surface_id } => self.open_surface(&surface_id),
            AppAction::LoadHistory { surface_id, limit } => self.load_history(&surface_id, limit),

            // Notifications
            AppAction::MarkNotificationRead { id } => {
                if let Some(rec) = self.gate.mark_read(&id) {
                    self.persister.send(PersistOp::SaveRecord(rec));
                    self.emit_state();
                }
            }
            AppAction::MarkAllNotificationsRead => {
                let changed = self.gate.mark_all_read();
                if changed.is_empty() {
                    return;
                }
                for rec in changed {
                    self.persister.send(PersistOp::SaveRecord(rec));
                }
                self.emit_state();
            }
            AppAction::ClearNotification { id } => {
                if let Some(rec) = self.gate.remove(&id) {
                    self.persister.send(PersistOp::DeleteRecord(rec.id));
                    self.emit_state();
                }
            }
            AppAction::UpdateNotificationSettings { settings } => {
                self.settings = settings;
                self.persister
                    .send(PersistOp::SaveSettings(self.settings.clone()));
                self.emit_state();
            }

            // UI
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
        }
    }
}
