// Notification gate: relevance, policy, dedup, then delivery.
//
// Received -> RelevanceChecked -> { Suppressed | PolicyGated | Delivered }

use std::collections::HashSet;
use std::time::{Duration, Instant};

use regex::Regex;

use super::classifier::Classification;
use crate::collaborators::DesktopAlert;
use crate::policy::{GateReason, NotificationSettings, Relevance};
use crate::state::{InboundEvent, NotificationRecord, NotificationType, SurfaceKind};

/// Sounds never play closer together than this, whatever the config says.
pub(super) const MIN_SOUND_DEBOUNCE: Duration = Duration::from_secs(2);

/// Finds `@everyone`, `@here` and mentions of the current user.
#[derive(Debug)]
pub(super) struct MentionMatcher {
    re: Regex,
    handles: Vec<String>,
}

impl MentionMatcher {
    pub(super) fn new(user_id: &str, display_name: &str) -> Result<Self, regex::Error> {
        let mut handles: Vec<String> = [display_name, user_id]
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        handles.dedup();
        let mut alts: Vec<String> = vec!["everyone".into(), "here".into()];
        alts.extend(handles.iter().map(|h| regex::escape(h)));
        // Leftmost-first alternation: longer handles must win over prefixes.
        alts.sort_by_key(|a| std::cmp::Reverse(a.len()));
        let re = Regex::new(&format!("(?i)@({})", alts.join("|")))?;
        Ok(Self { re, handles })
    }

    /// Strongest mention in `content`: a direct mention beats `@everyone`,
    /// which beats `@here`.
    pub(super) fn relevance(&self, content: &str) -> Option<Relevance> {
        let mut best: Option<Relevance> = None;
        for caps in self.re.captures_iter(content) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !bounded(content, whole.start(), whole.end()) {
                continue;
            }
            let name = name.as_str().to_lowercase();
            let found = if self.handles.iter().any(|h| *h == name) {
                Relevance::Direct
            } else if name == "everyone" {
                Relevance::Everyone
            } else {
                Relevance::Here
            };
            best = Some(match (best, found) {
                (Some(Relevance::Direct), _) | (_, Relevance::Direct) => Relevance::Direct,
                (Some(Relevance::Everyone), _) | (_, Relevance::Everyone) => Relevance::Everyone,
                _ => Relevance::Here,
            });
        }
        best
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn bounded(content: &str, start: usize, end: usize) -> bool {
    let before_ok = content[..start].chars().next_back().map_or(true, |c| !is_word(c));
    let after_ok = content[end..].chars().next().map_or(true, |c| !is_word(c));
    before_ok && after_ok
}

fn notification_type(relevance: Relevance) -> NotificationType {
    match relevance {
        Relevance::Direct => NotificationType::Mention,
        Relevance::Everyone => NotificationType::Everyone,
        Relevance::Here => NotificationType::Here,
        Relevance::Dm => NotificationType::Dm,
    }
}

fn preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => content[..idx].to_string(),
        None => content.to_string(),
    }
}

fn alert_title(ty: NotificationType, sender: &str, surface_id: &str) -> String {
    match ty {
        NotificationType::Dm => format!("Message from {sender}"),
        NotificationType::Mention => format!("{sender} mentioned you in {surface_id}"),
        NotificationType::Everyone => format!("{sender} mentioned @everyone in {surface_id}"),
        NotificationType::Here => format!("{sender} mentioned @here in {surface_id}"),
    }
}

pub(super) struct GateInput<'a> {
    pub(super) event: &'a InboundEvent,
    pub(super) kind: &'a SurfaceKind,
    pub(super) classification: Classification,
    pub(super) last_read_at: i64,
    /// The user is looking at this surface right now.
    pub(super) viewing: bool,
}

#[derive(Debug)]
pub(super) struct Delivery {
    pub(super) record: NotificationRecord,
    pub(super) desktop: Option<DesktopAlert>,
    pub(super) sound: bool,
}

#[derive(Debug)]
pub(super) enum GateOutcome {
    Irrelevant,
    /// Replayed history the user has already read past.
    AlreadyRead,
    PolicyGated(GateReason),
    Suppressed,
    Delivered(Delivery),
}

pub(super) struct NotificationGate {
    self_id: String,
    matcher: Option<MentionMatcher>,
    notified: HashSet<String>,
    /// Newest first.
    records: Vec<NotificationRecord>,
    last_sound_at: Option<Instant>,
    sound_debounce: Duration,
    preview_chars: usize,
    alert_on_replay: bool,
}

impl NotificationGate {
    pub(super) fn new(
        sound_debounce: Duration,
        preview_chars: usize,
        alert_on_replay: bool,
    ) -> Self {
        Self {
            self_id: String::new(),
            matcher: None,
            notified: HashSet::new(),
            records: Vec::new(),
            last_sound_at: None,
            sound_debounce: sound_debounce.max(MIN_SOUND_DEBOUNCE),
            preview_chars,
            alert_on_replay,
        }
    }

    pub(super) fn set_identity(&mut self, user_id: &str, display_name: &str) {
        self.self_id = user_id.to_string();
        self.matcher = match MentionMatcher::new(user_id, display_name) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(%e, "mention matcher unavailable");
                None
            }
        };
    }

    /// Merges records loaded from persistence. Keeps at most one per message.
    pub(super) fn load_persisted(&mut self, records: Vec<NotificationRecord>) {
        for rec in records {
            if self.has_record_for(&rec.message_id) {
                continue;
            }
            self.records.push(rec);
        }
        self.records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    fn has_record_for(&self, message_id: &str) -> bool {
        self.records.iter().any(|r| r.message_id == message_id)
    }

    pub(super) fn offer(
        &mut self,
        settings: &NotificationSettings,
        input: GateInput<'_>,
        now: Instant,
    ) -> GateOutcome {
        let event = input.event;
        if event.author_id == self.self_id {
            return GateOutcome::Irrelevant;
        }
        let relevance = if input.kind.is_conversation() {
            Some(Relevance::Dm)
        } else {
            self.matcher
                .as_ref()
                .and_then(|m| m.relevance(&event.content))
        };
        let Some(relevance) = relevance else {
            return GateOutcome::Irrelevant;
        };
        let replay = input.classification == Classification::Replay;
        if replay && event.timestamp <= input.last_read_at {
            return GateOutcome::AlreadyRead;
        }

        let policy = settings.resolve(&event.surface_id, input.kind);
        if let Err(reason) = policy.admit(relevance) {
            return GateOutcome::PolicyGated(reason);
        }

        if self.notified.contains(&event.id) || self.has_record_for(&event.id) {
            return GateOutcome::Suppressed;
        }
        self.notified.insert(event.id.clone());

        let ty = notification_type(relevance);
        let record = NotificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: event.id.clone(),
            surface_id: event.surface_id.clone(),
            notification_type: ty,
            sender_id: event.author_id.clone(),
            preview: preview(&event.content, self.preview_chars),
            timestamp: event.timestamp,
            read: false,
        };
        let pos = self
            .records
            .iter()
            .position(|r| r.timestamp <= record.timestamp)
            .unwrap_or(self.records.len());
        self.records.insert(pos, record.clone());

        let escalate = !input.viewing && (!replay || self.alert_on_replay);
        let desktop = (escalate && policy.desktop_enabled).then(|| DesktopAlert {
            title: alert_title(ty, &event.author_id, &event.surface_id),
            body: record.preview.clone(),
            surface_id: event.surface_id.clone(),
            message_id: event.id.clone(),
        });
        let sound = escalate && policy.sound_enabled && self.take_sound_slot(now);

        GateOutcome::Delivered(Delivery {
            record,
            desktop,
            sound,
        })
    }

    fn take_sound_slot(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_sound_at {
            if now.saturating_duration_since(last) < self.sound_debounce {
                return false;
            }
        }
        self.last_sound_at = Some(now);
        true
    }

    pub(super) fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    pub(super) fn unread_count(&self) -> u32 {
        self.records.iter().filter(|r| !r.read).count() as u32
    }

    /// Unread records on one surface; drives the surface's mention badge.
    pub(super) fn mention_count(&self, surface_id: &str) -> u32 {
        self.records
            .iter()
            .filter(|r| !r.read && r.surface_id == surface_id)
            .count() as u32
    }

    /// Returns the updated record when it changed.
    pub(super) fn mark_read(&mut self, id: &str) -> Option<NotificationRecord> {
        let rec = self.records.iter_mut().find(|r| r.id == id && !r.read)?;
        rec.read = true;
        Some(rec.clone())
    }

    pub(super) fn mark_all_read(&mut self) -> Vec<NotificationRecord> {
        self.mark_where(|_| true)
    }

    /// Marks every record on `surface_id` read (the user opened it).
    pub(super) fn clear_mentions(&mut self, surface_id: &str) -> Vec<NotificationRecord> {
        self.mark_where(|r| r.surface_id == surface_id)
    }

    fn mark_where(
        &mut self,
        pred: impl Fn(&NotificationRecord) -> bool,
    ) -> Vec<NotificationRecord> {
        let mut changed = Vec::new();
        for rec in self.records.iter_mut().filter(|r| !r.read && pred(&**r)) {
            rec.read = true;
            changed.push(rec.clone());
        }
        changed
    }

    /// Drops a record from the list. Its message never notifies again.
    pub(super) fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        let rec = self.records.remove(pos);
        self.notified.insert(rec.message_id.clone());
        Some(rec)
    }

    pub(super) fn reset(&mut self) {
        self.self_id.clear();
        self.matcher = None;
        self.notified.clear();
        self.records.clear();
        self.last_sound_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ChannelLevel, NodeLevel, NodeOverride};
    use crate::state::SurfaceDescriptor;

    fn gate() -> NotificationGate {
        let mut g = NotificationGate::new(Duration::from_secs(2), 120, false);
        g.set_identity("u-alice", "Alice");
        g
    }

    fn channel() -> SurfaceKind {
        SurfaceDescriptor::channel("general", "node-1").kind
    }

    fn input<'a>(event: &'a InboundEvent, kind: &'a SurfaceKind) -> GateInput<'a> {
        GateInput {
            event,
            kind,
            classification: Classification::Live,
            last_read_at: 0,
            viewing: false,
        }
    }

    #[test]
    fn matcher_finds_the_strongest_mention() {
        let m = MentionMatcher::new("u-alice", "Alice").unwrap();
        assert_eq!(m.relevance("hey @alice look"), Some(Relevance::Direct));
        assert_eq!(m.relevance("@here and @ALICE"), Some(Relevance::Direct));
        assert_eq!(m.relevance("@here then @everyone"), Some(Relevance::Everyone));
        assert_eq!(m.relevance("ping @here."), Some(Relevance::Here));
        assert_eq!(m.relevance("@u-alice"), Some(Relevance::Direct));
        assert_eq!(m.relevance("@alicebot hi"), None);
        assert_eq!(m.relevance("mail@here.com"), None);
        assert_eq!(m.relevance("nothing to see"), None);
    }

    #[test]
    fn display_names_with_spaces_match() {
        let m = MentionMatcher::new("u1", "Ada Lovelace").unwrap();
        assert_eq!(m.relevance("thanks @ada lovelace!"), Some(Relevance::Direct));
        assert_eq!(m.relevance("thanks @ada"), None);
    }

    #[test]
    fn delivers_once_per_message() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let ev = InboundEvent::text("m1", "general", "bob", 10, "@alice hi");
        let now = Instant::now();
        let GateOutcome::Delivered(d) = g.offer(&s, input(&ev, &kind), now) else {
            panic!("expected delivery");
        };
        assert_eq!(d.record.notification_type, NotificationType::Mention);
        assert!(d.desktop.is_some());
        assert!(d.sound);
        assert!(matches!(g.offer(&s, input(&ev, &kind), now), GateOutcome::Suppressed));
        assert_eq!(g.records().len(), 1);
        assert_eq!(g.mention_count("general"), 1);
    }

    #[test]
    fn persisted_records_block_redelivery() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let ev = InboundEvent::text("m1", "general", "bob", 10, "@everyone");
        g.load_persisted(vec![NotificationRecord {
            id: "n-old".into(),
            message_id: "m1".into(),
            surface_id: "general".into(),
            notification_type: NotificationType::Everyone,
            sender_id: "bob".into(),
            preview: "@everyone".into(),
            timestamp: 10,
            read: true,
        }]);
        assert!(matches!(
            g.offer(&s, input(&ev, &kind), Instant::now()),
            GateOutcome::Suppressed
        ));
    }

    #[test]
    fn own_and_unmentioned_messages_are_irrelevant() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let own = InboundEvent::text("m1", "general", "u-alice", 1, "@everyone");
        let plain = InboundEvent::text("m2", "general", "bob", 1, "hello");
        assert!(matches!(g.offer(&s, input(&own, &kind), Instant::now()), GateOutcome::Irrelevant));
        assert!(matches!(g.offer(&s, input(&plain, &kind), Instant::now()), GateOutcome::Irrelevant));
    }

    #[test]
    fn suppress_everyone_drops_broadcast_but_keeps_direct() {
        let mut g = gate();
        let mut s = NotificationSettings::default();
        s.nodes.insert(
            "node-1".into(),
            NodeOverride {
                level: NodeLevel::All,
                suppress_everyone: true,
            },
        );
        s.channels.insert("general".into(), ChannelLevel::Mentions);
        let kind = channel();
        let broadcast = InboundEvent::text("m1", "general", "bob", 1, "@everyone");
        let direct = InboundEvent::text("m2", "general", "bob", 2, "@Alice");
        assert!(matches!(
            g.offer(&s, input(&broadcast, &kind), Instant::now()),
            GateOutcome::PolicyGated(GateReason::EveryoneSuppressed)
        ));
        assert!(matches!(
            g.offer(&s, input(&direct, &kind), Instant::now()),
            GateOutcome::Delivered(_)
        ));
    }

    #[test]
    fn viewing_keeps_record_but_skips_alerts() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let ev = InboundEvent::text("m1", "general", "bob", 1, "@here");
        let mut inp = input(&ev, &kind);
        inp.viewing = true;
        let GateOutcome::Delivered(d) = g.offer(&s, inp, Instant::now()) else {
            panic!("expected delivery");
        };
        assert!(d.desktop.is_none());
        assert!(!d.sound);
    }

    #[test]
    fn replay_creates_records_only_after_last_read_without_alerts() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let old = InboundEvent::text("m1", "general", "bob", 50, "@alice");
        let fresh = InboundEvent::text("m2", "general", "bob", 150, "@alice");
        let mut replayed = input(&old, &kind);
        replayed.classification = Classification::Replay;
        replayed.last_read_at = 100;
        assert!(matches!(g.offer(&s, replayed, Instant::now()), GateOutcome::AlreadyRead));
        let mut replayed = input(&fresh, &kind);
        replayed.classification = Classification::Replay;
        replayed.last_read_at = 100;
        let GateOutcome::Delivered(d) = g.offer(&s, replayed, Instant::now()) else {
            panic!("expected delivery");
        };
        assert!(d.desktop.is_none());
        assert!(!d.sound);
    }

    #[test]
    fn sound_is_debounced() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        let t0 = Instant::now();
        let a = InboundEvent::text("m1", "general", "bob", 1, "@alice");
        let b = InboundEvent::text("m2", "general", "bob", 2, "@alice");
        let c = InboundEvent::text("m3", "general", "bob", 3, "@alice");
        let sound = |o: GateOutcome| match o {
            GateOutcome::Delivered(d) => d.sound,
            other => panic!("unexpected {other:?}"),
        };
        assert!(sound(g.offer(&s, input(&a, &kind), t0)));
        assert!(!sound(g.offer(&s, input(&b, &kind), t0 + Duration::from_millis(500))));
        assert!(sound(g.offer(&s, input(&c, &kind), t0 + Duration::from_secs(3))));
    }

    #[test]
    fn dm_toggle_and_dnd() {
        let mut g = gate();
        let mut s = NotificationSettings::default();
        let kind = SurfaceDescriptor::conversation("dm:bob", "bob").kind;
        let ev = InboundEvent::text("m1", "dm:bob", "bob", 1, "hey");
        s.global.dm_notifications = false;
        assert!(matches!(
            g.offer(&s, input(&ev, &kind), Instant::now()),
            GateOutcome::PolicyGated(GateReason::DmDisabled)
        ));
        s.global.dm_notifications = true;
        s.global.do_not_disturb = true;
        assert!(matches!(
            g.offer(&s, input(&ev, &kind), Instant::now()),
            GateOutcome::PolicyGated(GateReason::DoNotDisturb)
        ));
        s.global.do_not_disturb = false;
        let GateOutcome::Delivered(d) = g.offer(&s, input(&ev, &kind), Instant::now()) else {
            panic!("expected delivery");
        };
        assert_eq!(d.record.notification_type, NotificationType::Dm);
    }

    #[test]
    fn read_and_remove_operations() {
        let mut g = gate();
        let s = NotificationSettings::default();
        let kind = channel();
        for (i, ts) in [(1, 10), (2, 30), (3, 20)] {
            let ev = InboundEvent::text(format!("m{i}"), "general", "bob", ts, "@here");
            g.offer(&s, input(&ev, &kind), Instant::now());
        }
        let ts: Vec<i64> = g.records().iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![30, 20, 10]);

        let first = g.records()[0].id.clone();
        assert!(g.mark_read(&first).is_some());
        assert!(g.mark_read(&first).is_none());
        assert_eq!(g.unread_count(), 2);
        assert_eq!(g.mark_all_read().len(), 2);
        assert_eq!(g.unread_count(), 0);

        let removed = g.remove(&first).unwrap();
        assert_eq!(g.records().len(), 2);
        let again = InboundEvent::text(removed.message_id, "general", "bob", 30, "@here");
        assert!(matches!(
            g.offer(&s, input(&again, &kind), Instant::now()),
            GateOutcome::Suppressed
        ));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 4), "héll");
        assert_eq!(preview("short", 120), "short");
    }
}
