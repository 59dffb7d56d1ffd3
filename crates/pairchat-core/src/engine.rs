//! The matchmaking and connection-lifecycle engine.
//!
//! [`Engine`] is a synchronous state machine. It owns its ports (transport,
//! presence client, key-value store, scheduler) and is fed inputs one at a
//! time: presence snapshots, transport events, fired timers, relay batches
//! and host operations. Everything it wants the host to know is queued as an
//! [`EngineEvent`] and collected with [`Engine::drain_events`].
//!
//! Exactly one task owns an engine (see [`crate::runtime`]), which makes the
//! in-flight guard and the primary-connection reference race free.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use pairchat_net::{PendingMessage, PresenceClient, Snapshot, Transport, TransportEvent};
use pairchat_shared::config::EngineConfig;
use pairchat_shared::error::Fault;
use pairchat_shared::identity::Identity;
use pairchat_shared::message::{clamp_expiry, Content, Message, MessageId, Reaction, ReplyRef, Sender};
use pairchat_shared::protocol::Frame;
use pairchat_shared::types::{ConnectionId, ConnectionRole, PeerAddress, Profile};
use pairchat_store::history::{append_history, load_history};
use pairchat_store::{FriendRecord, KeyValueStore, RecentPeers};

use crate::conversation::Conversation;
use crate::error::{EngineError, Result};
use crate::events::{ConversationKey, EngineEvent, Indicator};
use crate::friends::FriendBook;
use crate::handler::Link;
use crate::matchmaker::{Attempt, AttemptPhase, Matchmaker};
use crate::scheduler::{to_chrono, Scheduler, Timer, TimerHandle};
use crate::session::{DisconnectReason, Session, SessionState};

/// The primary link. Set from accept (inbound) or open (outbound) until close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryLink {
    pub conn: ConnectionId,
    pub peer: PeerAddress,
    pub open: bool,
}

/// An open secondary link and the profile its peer announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryLink {
    pub conn: ConnectionId,
    pub profile: Option<Profile>,
}

/// External collaborators injected into the engine.
pub struct Ports {
    pub transport: Box<dyn Transport>,
    pub presence: Box<dyn PresenceClient>,
    pub store: Box<dyn KeyValueStore>,
    pub scheduler: Box<dyn Scheduler>,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) identity: Identity,
    pub(crate) transport: Box<dyn Transport>,
    presence: Box<dyn PresenceClient>,
    pub(crate) store: Box<dyn KeyValueStore>,
    pub(crate) scheduler: Box<dyn Scheduler>,
    rng: StdRng,

    pub(crate) session: Session,
    matchmaker: Matchmaker,
    snapshot: Snapshot,
    pub(crate) primary: Option<PrimaryLink>,
    /// Armed while an accepted inbound primary waits for its open.
    inbound_timer: Option<TimerHandle>,
    pub(crate) primary_conversation: Conversation,
    vanish_timers: HashMap<ConversationKey, HashMap<MessageId, TimerHandle>>,
    pub(crate) secondaries: HashMap<PeerAddress, SecondaryLink>,
    pending_secondaries: HashMap<ConnectionId, PeerAddress>,
    secondary_conversations: HashMap<PeerAddress, Conversation>,

    pub(crate) friends: FriendBook,
    pub(crate) recent: RecentPeers,
    seen_relay_ids: HashSet<String>,

    events: VecDeque<EngineEvent>,
}

impl Engine {
    pub fn new(config: EngineConfig, mut identity: Identity, ports: Ports) -> Self {
        let mut events = VecDeque::new();
        let debounce = to_chrono(config.last_seen_debounce);

        let friends = match FriendBook::load(ports.store.as_ref(), debounce) {
            Ok(book) => book,
            Err(e) => {
                warn!(error = %e, "Failed to load friend list, starting empty");
                events.push_back(EngineEvent::Fault(Fault::PersistenceFault(e.to_string())));
                FriendBook::new(debounce)
            }
        };
        let recent = match RecentPeers::load(ports.store.as_ref(), config.recent_peers_limit) {
            Ok(recent) => recent,
            Err(e) => {
                warn!(error = %e, "Failed to load recent peers, starting empty");
                events.push_back(EngineEvent::Fault(Fault::PersistenceFault(e.to_string())));
                RecentPeers::new(config.recent_peers_limit)
            }
        };

        let transport_addr = ports.transport.local_address().clone();
        if identity.address != transport_addr {
            warn!(
                identity = %identity.address.short(),
                transport = %transport_addr.short(),
                "Identity address differs from transport address, using the transport's"
            );
            identity.address = transport_addr;
        }

        Self {
            config,
            identity,
            transport: ports.transport,
            presence: ports.presence,
            store: ports.store,
            scheduler: ports.scheduler,
            rng: StdRng::from_entropy(),
            session: Session::new(),
            matchmaker: Matchmaker::new(),
            snapshot: Snapshot::default(),
            primary: None,
            inbound_timer: None,
            primary_conversation: Conversation::new(),
            vanish_timers: HashMap::new(),
            secondaries: HashMap::new(),
            pending_secondaries: HashMap::new(),
            secondary_conversations: HashMap::new(),
            friends,
            recent,
            seen_relay_ids: HashSet::new(),
            events,
        }
    }

    /// Replace the random source, for reproducible matching.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Publish the initial presence record and arm the periodic timers.
    pub fn start(&mut self) {
        info!(
            addr = %self.identity.address.short(),
            name = %self.identity.profile.name,
            "Engine started"
        );
        self.publish_state();
        self.scheduler.schedule(self.config.poll_interval, Timer::Poll);
        self.scheduler
            .schedule(self.config.cooldown_clear, Timer::CooldownSweep);
    }

    /// Close every link and leave the presence directory.
    pub fn shutdown(&mut self) {
        self.abandon_attempt();
        if let Some(link) = self.take_primary() {
            if link.open {
                let _ = self.transport.send(link.conn, &Frame::disconnect());
            }
            self.transport.close(link.conn);
        }
        for (_, link) in self.secondaries.drain() {
            self.transport.close(link.conn);
        }
        for (conn, _) in self.pending_secondaries.drain() {
            self.transport.close(conn);
        }
        if let Err(e) = self.presence.leave() {
            warn!(error = %e, "Failed to leave presence directory");
        }
        info!("Engine shut down");
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn address(&self) -> &PeerAddress {
        &self.identity.address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn primary(&self) -> Option<&PrimaryLink> {
        self.primary.as_ref()
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    pub fn friends(&self) -> &FriendBook {
        &self.friends
    }

    pub fn recent_peers(&self) -> &RecentPeers {
        &self.recent
    }

    pub fn secondary(&self, peer: &PeerAddress) -> Option<&SecondaryLink> {
        self.secondaries.get(peer)
    }

    pub fn secondary_peers(&self) -> Vec<&PeerAddress> {
        self.secondaries.keys().collect()
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        match key {
            ConversationKey::Primary => Some(&self.primary_conversation),
            ConversationKey::Secondary(peer) => self.secondary_conversations.get(peer),
        }
    }

    /// Messages of `key` not yet past their expiry.
    pub fn visible_messages(&self, key: &ConversationKey) -> Vec<Message> {
        let now = self.scheduler.now();
        self.conversation(key)
            .map(|conv| conv.visible(now).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Persisted history under `key`, expired messages included.
    pub fn stored_history(&self, key: &str) -> Result<Vec<Message>> {
        Ok(load_history(self.store.as_ref(), key)?)
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.scheduler.now()
    }

    pub(crate) fn emit(&mut self, event: EngineEvent) {
        trace!(event = ?event, "Engine event");
        self.events.push_back(event);
    }

    fn emit_state(&mut self) {
        let state = self.session.state();
        self.emit(EngineEvent::StateChanged(state));
    }

    fn publish_state(&mut self) {
        let status = self.session.state().presence_status();
        if let Err(e) = self.presence.publish(status, &self.identity.profile) {
            warn!(error = %e, ?status, "Presence publish failed");
            self.emit(EngineEvent::Fault(Fault::TransportFault(format!(
                "presence publish failed: {e}"
            ))));
        }
    }

    /// Log a failed write and surface it as a notice. The in-memory state
    /// stays authoritative.
    pub(crate) fn persist(&mut self, what: &'static str, result: pairchat_store::Result<()>) {
        if let Err(e) = result {
            warn!(what, error = %e, "Persistence failed");
            self.emit(EngineEvent::Fault(Fault::PersistenceFault(format!("{what}: {e}"))));
        }
    }

    pub(crate) fn conversation_mut(&mut self, key: &ConversationKey) -> &mut Conversation {
        match key {
            ConversationKey::Primary => &mut self.primary_conversation,
            ConversationKey::Secondary(peer) => self
                .secondary_conversations
                .entry(peer.clone())
                .or_default(),
        }
    }

    /// Store key of a secondary peer's history: stable id when known.
    pub fn history_key(&self, peer: &PeerAddress) -> String {
        self.secondaries
            .get(peer)
            .and_then(|link| link.profile.as_ref())
            .map(|profile| profile.identity_key(peer))
            .unwrap_or_else(|| peer.to_string())
    }

    /// Add a message to its conversation, arm its expiry and, for secondary
    /// conversations, append it to the persisted history.
    pub(crate) fn insert_message(&mut self, key: &ConversationKey, message: Message) -> Result<()> {
        let expiry = message.expiry_duration;
        let id = message.id.clone();
        let history = match key {
            ConversationKey::Secondary(peer) => Some((self.history_key(peer), message.clone())),
            ConversationKey::Primary => None,
        };

        self.conversation_mut(key).insert(message)?;

        if let Some(ms) = expiry {
            let handle = self.scheduler.schedule(
                Duration::from_millis(clamp_expiry(ms)),
                Timer::VanishExpiry {
                    conversation: key.clone(),
                    message_id: id.clone(),
                },
            );
            self.vanish_timers
                .entry(key.clone())
                .or_default()
                .insert(id, handle);
        }
        if let Some((history_key, message)) = history {
            let result = append_history(self.store.as_mut(), &history_key, &message);
            self.persist("history", result);
        }
        Ok(())
    }

    /// Drop the primary conversation together with its pending expiries.
    fn clear_primary_conversation(&mut self) {
        self.primary_conversation.clear();
        if let Some(timers) = self.vanish_timers.remove(&ConversationKey::Primary) {
            for (_, handle) in timers {
                self.scheduler.cancel(handle);
            }
        }
    }

    /// Forget the primary link, disarming its open timeout.
    fn take_primary(&mut self) -> Option<PrimaryLink> {
        if let Some(handle) = self.inbound_timer.take() {
            self.scheduler.cancel(handle);
        }
        self.primary.take()
    }

    /// Connection to talk to `key` over.
    fn link_for(&self, key: &ConversationKey) -> Result<ConnectionId> {
        let conn = match key {
            ConversationKey::Primary => self
                .primary
                .as_ref()
                .filter(|link| link.open && self.session.is_connected())
                .map(|link| link.conn),
            ConversationKey::Secondary(peer) => self.secondaries.get(peer).map(|link| link.conn),
        };
        conn.ok_or_else(|| EngineError::NotConnected(key.clone()))
    }

    /// Any open connection to `peer`, primary first.
    fn link_to(&self, peer: &PeerAddress) -> Option<ConnectionId> {
        self.primary
            .as_ref()
            .filter(|link| link.open && &link.peer == peer)
            .map(|link| link.conn)
            .or_else(|| self.secondaries.get(peer).map(|link| link.conn))
    }

    pub(crate) fn secondary_peer(&self, conn: ConnectionId) -> Option<PeerAddress> {
        self.secondaries
            .iter()
            .find(|(_, link)| link.conn == conn)
            .map(|(peer, _)| peer.clone())
    }

    fn jitter(&mut self) -> Duration {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        if max <= min {
            min
        } else {
            self.rng.gen_range(min..=max)
        }
    }

    // -----------------------------------------------------------------------
    // Matchmaking
    // -----------------------------------------------------------------------

    fn run_matchmaker(&mut self) {
        if !self.session.is_searching() || self.matchmaker.in_flight() || self.primary.is_some() {
            return;
        }
        let Some(candidate) =
            self.matchmaker
                .pick_candidate(&self.snapshot, &self.identity.address, &mut self.rng)
        else {
            trace!("No eligible waiters");
            return;
        };

        let id = self.matchmaker.next_attempt_id();
        let delay = self.jitter();
        let timer = self
            .scheduler
            .schedule(delay, Timer::DialAfterJitter { attempt: id });
        self.matchmaker.begin(id, candidate.clone(), timer);
        debug!(attempt = id, candidate = %candidate.short(), ?delay, "Candidate picked");
    }

    fn on_dial_after_jitter(&mut self, id: u64) {
        let Some(attempt) = self.matchmaker.current(id) else {
            trace!(attempt = id, "Stale jitter timer");
            return;
        };
        if !matches!(attempt.phase, AttemptPhase::Jitter { .. }) {
            return;
        }
        let candidate = attempt.candidate.clone();

        if !self.session.is_searching()
            || self.primary.is_some()
            || !self.matchmaker.still_eligible(&self.snapshot, &candidate)
        {
            debug!(attempt = id, candidate = %candidate.short(), "State changed during jitter, attempt dropped");
            self.matchmaker.abandon();
            return;
        }

        match self.transport.connect(&candidate, ConnectionRole::Primary) {
            Ok(conn) => {
                let timer = self
                    .scheduler
                    .schedule(self.config.attempt_timeout, Timer::AttemptTimeout { attempt: id });
                self.matchmaker.dialing(conn, timer);
                info!(attempt = id, %conn, candidate = %candidate.short(), "Dialing candidate");
            }
            Err(e) => {
                warn!(candidate = %candidate.short(), error = %e, "Dial failed");
                self.matchmaker.fail();
                self.emit(EngineEvent::Fault(Fault::PeerUnreachable(candidate)));
            }
        }
    }

    fn on_attempt_timeout(&mut self, id: u64) {
        let Some(conn) = self.matchmaker.current(id).and_then(Attempt::conn) else {
            trace!(attempt = id, "Stale attempt timeout");
            return;
        };
        self.transport.close(conn);
        if let Some(attempt) = self.matchmaker.fail() {
            info!(attempt = id, candidate = %attempt.candidate.short(), "Attempt timed out, candidate cooling down");
            self.emit(EngineEvent::Fault(Fault::ConnectionTimeout(attempt.candidate)));
        }
    }

    fn on_inbound_open_timeout(&mut self, conn: ConnectionId) {
        let pending = self
            .primary
            .as_ref()
            .is_some_and(|link| link.conn == conn && !link.open);
        if !pending {
            trace!(%conn, "Stale inbound open timeout");
            return;
        }
        self.inbound_timer = None;
        if let Some(link) = self.primary.take() {
            self.transport.close(conn);
            info!(%conn, peer = %link.peer.short(), "Inbound primary never opened, dropped");
            self.emit(EngineEvent::Fault(Fault::ConnectionTimeout(link.peer)));
        }
        self.run_matchmaker();
    }

    /// Drop the in-flight attempt without penalising its candidate.
    fn abandon_attempt(&mut self) {
        if let Some(attempt) = self.matchmaker.abandon() {
            self.scheduler.cancel(attempt.timer());
            if let Some(conn) = attempt.conn() {
                self.transport.close(conn);
            }
            debug!(attempt = attempt.id, "Attempt abandoned");
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    pub fn on_presence_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
        let now = self.now();
        if self.friends.refresh_last_seen(&self.snapshot, now) {
            let result = self.friends.save(self.store.as_mut());
            self.persist("friends", result);
        }
        self.run_matchmaker();
    }

    pub fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Poll => {
                self.run_matchmaker();
                self.scheduler.schedule(self.config.poll_interval, Timer::Poll);
            }
            Timer::CooldownSweep => {
                let cleared = self.matchmaker.clear_cooldown();
                if cleared > 0 {
                    debug!(cleared, "Cooldown set cleared");
                }
                self.scheduler
                    .schedule(self.config.cooldown_clear, Timer::CooldownSweep);
            }
            Timer::DialAfterJitter { attempt } => self.on_dial_after_jitter(attempt),
            Timer::AttemptTimeout { attempt } => self.on_attempt_timeout(attempt),
            Timer::InboundOpenTimeout { conn } => self.on_inbound_open_timeout(conn),
            Timer::VanishExpiry {
                conversation,
                message_id,
            } => {
                let armed = self
                    .vanish_timers
                    .get_mut(&conversation)
                    .and_then(|timers| timers.remove(&message_id));
                if armed.is_none() {
                    trace!(id = %message_id, "Stale expiry timer");
                    return;
                }
                let expired = self.conversation_mut(&conversation).expire(&message_id).cloned();
                if let Some(message) = expired {
                    trace!(id = %message_id, "Message expired");
                    self.emit(EngineEvent::MessageUpdated {
                        conversation,
                        message,
                    });
                }
            }
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming { conn, peer, role } => match role {
                ConnectionRole::Primary => self.on_incoming_primary(conn, peer),
                ConnectionRole::Secondary => self.on_incoming_secondary(conn, peer),
            },
            TransportEvent::Opened { conn, peer } => self.on_opened(conn, peer),
            TransportEvent::Data { conn, data } => self.on_data(conn, &data),
            TransportEvent::Closed { conn } => self.on_closed(conn, None),
            TransportEvent::Failed { conn, error } => self.on_closed(conn, Some(error)),
        }
    }

    /// The local transport became unusable.
    pub fn on_transport_lost(&mut self, reason: &str) {
        error!(reason, "Transport lost");
        self.abandon_attempt();
        if let Some(link) = self.take_primary() {
            self.transport.close(link.conn);
        }
        for (_, link) in self.secondaries.drain() {
            self.transport.close(link.conn);
        }
        self.pending_secondaries.clear();
        self.clear_primary_conversation();
        self.session.fail();
        self.emit(EngineEvent::Fault(Fault::TransportFault(reason.to_string())));
        self.publish_state();
        self.emit_state();
    }

    pub fn on_relay_messages(&mut self, batch: Vec<PendingMessage>) {
        for pending in batch {
            if !self.seen_relay_ids.insert(pending.id.clone()) {
                trace!(id = %pending.id, "Relay message already seen");
                continue;
            }
            let sender_id = pending.sender_id;
            let content = Content::from_data_type(Some(pending.kind.as_str()), pending.content);
            let message = Message::new(pending.id, content, Sender::Stranger, pending.created_at);

            let result = append_history(self.store.as_mut(), &sender_id, &message);
            self.persist("relay history", result);
            debug!(id = %message.id, sender = %sender_id, "Relay message delivered");
            self.emit(EngineEvent::RelayMessage { sender_id, message });
        }
    }

    fn on_incoming_primary(&mut self, conn: ConnectionId, peer: PeerAddress) {
        if !self.session.is_searching() || self.primary.is_some() {
            debug!(
                %conn,
                peer = %peer.short(),
                state = %self.session.state(),
                "{}",
                Fault::DuplicateConnection(peer.clone())
            );
            self.transport.reject(conn);
            return;
        }
        let own_dial_pending = self
            .matchmaker
            .attempt()
            .is_some_and(|attempt| attempt.conn().is_some());
        if own_dial_pending && self.identity.address < peer {
            debug!(%conn, peer = %peer.short(), "Crossed dials, keeping our own");
            self.transport.reject(conn);
            return;
        }

        self.abandon_attempt();
        match self.transport.accept(conn) {
            Ok(_) => {
                debug!(%conn, peer = %peer.short(), "Inbound primary accepted");
                self.primary = Some(PrimaryLink {
                    conn,
                    peer,
                    open: false,
                });
                self.inbound_timer = Some(
                    self.scheduler
                        .schedule(self.config.attempt_timeout, Timer::InboundOpenTimeout { conn }),
                );
            }
            Err(e) => {
                warn!(%conn, error = %e, "Accept failed");
                self.emit(EngineEvent::Fault(Fault::TransportFault(e.to_string())));
            }
        }
    }

    fn on_incoming_secondary(&mut self, conn: ConnectionId, peer: PeerAddress) {
        if let Some(old) = self.secondaries.remove(&peer) {
            debug!(old = %old.conn, new = %conn, peer = %peer.short(), "Replacing secondary link");
            self.transport.close(old.conn);
        }
        let stale: Vec<ConnectionId> = self
            .pending_secondaries
            .iter()
            .filter(|(_, p)| **p == peer)
            .map(|(c, _)| *c)
            .collect();
        for old in stale {
            self.pending_secondaries.remove(&old);
            self.transport.close(old);
        }

        match self.transport.accept(conn) {
            Ok(_) => {
                self.pending_secondaries.insert(conn, peer);
            }
            Err(e) => {
                warn!(%conn, error = %e, "Accept failed");
                self.emit(EngineEvent::Fault(Fault::TransportFault(e.to_string())));
            }
        }
    }

    fn on_opened(&mut self, conn: ConnectionId, peer: PeerAddress) {
        if self.matchmaker.dialing_on(conn).is_some() {
            if !self.session.is_searching() || self.primary.is_some() {
                self.abandon_attempt();
                return;
            }
            if let Some(attempt) = self.matchmaker.connected() {
                self.scheduler.cancel(attempt.timer());
            }
            self.primary = Some(PrimaryLink {
                conn,
                peer: peer.clone(),
                open: true,
            });
            self.on_primary_open(conn, peer);
            return;
        }

        let inbound = match self.primary.as_mut() {
            Some(link) if link.conn == conn && !link.open => {
                link.open = true;
                Some(link.peer.clone())
            }
            _ => None,
        };
        if let Some(peer) = inbound {
            if let Some(handle) = self.inbound_timer.take() {
                self.scheduler.cancel(handle);
            }
            self.matchmaker.connected();
            self.on_primary_open(conn, peer);
            return;
        }

        if let Some(peer) = self.pending_secondaries.remove(&conn) {
            if let Some(old) = self.secondaries.insert(
                peer.clone(),
                SecondaryLink {
                    conn,
                    profile: None,
                },
            ) {
                self.transport.close(old.conn);
            }
            info!(%conn, peer = %peer.short(), "Secondary link open");
            if let Err(e) = self.transport.send(conn, &Frame::profile(&self.identity.profile)) {
                warn!(%conn, error = %e, "Failed to send profile");
            }
            self.emit(EngineEvent::SecondaryOpened(peer));
            return;
        }

        trace!(%conn, "Open for unknown connection");
    }

    fn on_primary_open(&mut self, conn: ConnectionId, peer: PeerAddress) {
        if let Err(e) = self.session.pair(peer.clone()) {
            warn!(%conn, error = %e, "Primary opened in the wrong state, closing");
            self.take_primary();
            self.transport.close(conn);
            return;
        }
        info!(%conn, peer = %peer.short(), "Session connected");
        if let Err(e) = self.transport.send(conn, &Frame::profile(&self.identity.profile)) {
            warn!(%conn, error = %e, "Failed to send profile");
        }
        self.publish_state();
        self.emit_state();
    }

    fn on_data(&mut self, conn: ConnectionId, data: &[u8]) {
        let frame = match Frame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%conn, error = %e, "{}", Fault::ProtocolViolation("malformed frame".into()));
                return;
            }
        };
        let link = if self.primary.as_ref().is_some_and(|link| link.conn == conn) {
            Link::Primary
        } else if let Some(peer) = self.secondary_peer(conn) {
            Link::Secondary(peer)
        } else {
            trace!(%conn, "Frame on unknown connection");
            return;
        };
        let kind = frame.kind;
        if let Err(e) = self.dispatch(link, frame) {
            warn!(%conn, ?kind, error = %e, "Frame dropped");
        }
    }

    fn on_closed(&mut self, conn: ConnectionId, error: Option<String>) {
        if self.matchmaker.dialing_on(conn).is_some() {
            if let Some(attempt) = self.matchmaker.fail() {
                self.scheduler.cancel(attempt.timer());
                debug!(%conn, candidate = %attempt.candidate.short(), error = ?error, "Dial refused, candidate cooling down");
                self.emit(EngineEvent::Fault(Fault::PeerUnreachable(attempt.candidate)));
            }
            return;
        }

        if self.primary.as_ref().is_some_and(|link| link.conn == conn) {
            self.take_primary();
            if let Some(error) = error {
                self.emit(EngineEvent::Fault(Fault::TransportFault(error)));
            }
            if self.session.is_connected() {
                info!(%conn, "Primary link dropped");
                self.end_session(DisconnectReason::Network);
            } else {
                debug!(%conn, "Pending primary link dropped");
            }
            return;
        }

        if let Some(peer) = self.pending_secondaries.remove(&conn) {
            debug!(%conn, peer = %peer.short(), error = ?error, "Secondary link never opened");
            if error.is_some() {
                self.emit(EngineEvent::Fault(Fault::PeerUnreachable(peer)));
            }
            return;
        }

        if let Some(peer) = self.secondary_peer(conn) {
            self.secondaries.remove(&peer);
            info!(%conn, peer = %peer.short(), "Secondary link closed");
            self.emit(EngineEvent::SecondaryClosed(peer));
            return;
        }

        trace!(%conn, "Close for unknown connection");
    }

    /// Connected → Disconnected. The caller has already dropped the link.
    pub(crate) fn end_session(&mut self, reason: DisconnectReason) {
        if self.session.end(reason).is_err() {
            return;
        }
        self.clear_primary_conversation();
        self.publish_state();
        self.emit_state();
    }

    /// Close the primary link and end the session.
    pub(crate) fn close_primary(&mut self, reason: DisconnectReason) {
        if let Some(link) = self.take_primary() {
            self.transport.close(link.conn);
        }
        self.end_session(reason);
    }

    pub(crate) fn close_secondary_link(&mut self, peer: &PeerAddress) {
        if let Some(link) = self.secondaries.remove(peer) {
            self.transport.close(link.conn);
            self.emit(EngineEvent::SecondaryClosed(peer.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Host operations
    // -----------------------------------------------------------------------

    /// Start looking for a partner.
    pub fn connect(&mut self) -> Result<()> {
        self.session.begin_search()?;
        info!("Searching for a partner");
        self.publish_state();
        self.emit_state();
        self.run_matchmaker();
        Ok(())
    }

    /// Stop searching.
    pub fn cancel(&mut self) -> Result<()> {
        self.session.cancel()?;
        self.abandon_attempt();
        if let Some(link) = self.take_primary() {
            self.transport.close(link.conn);
        }
        self.clear_primary_conversation();
        info!("Search cancelled");
        self.publish_state();
        self.emit_state();
        Ok(())
    }

    /// End the session (or stop searching).
    pub fn disconnect(&mut self) -> Result<()> {
        match self.session.state() {
            SessionState::Connected => {
                if let Some(link) = self.primary.as_ref() {
                    if let Err(e) = self.transport.send(link.conn, &Frame::disconnect()) {
                        debug!(error = %e, "Could not send disconnect frame");
                    }
                }
                info!("Session ended locally");
                self.close_primary(DisconnectReason::LocalNetwork);
                Ok(())
            }
            SessionState::Searching => self.cancel(),
            state => Err(EngineError::InvalidState {
                operation: "disconnect",
                state,
            }),
        }
    }

    /// Disconnect (if needed) and search again.
    pub fn start_over(&mut self) -> Result<()> {
        if matches!(
            self.session.state(),
            SessionState::Connected | SessionState::Searching
        ) {
            self.disconnect()?;
        }
        self.connect()
    }

    /// Leave Disconnected or Error for Idle.
    pub fn reset(&mut self) -> Result<()> {
        self.session.reset()?;
        self.publish_state();
        self.emit_state();
        Ok(())
    }

    /// Send a message and return its id. On the primary conversation the
    /// vanish expiry applies when either side has vanish mode on.
    pub fn send_message(
        &mut self,
        key: &ConversationKey,
        content: Content,
        reply_to: Option<&str>,
    ) -> Result<MessageId> {
        let conn = self.link_for(key)?;
        let reply = reply_to.map(|id| self.reply_ref(key, id)).transpose()?;
        let vanish = *key == ConversationKey::Primary && self.session.vanish_active();
        let expiry_ms =
            vanish.then(|| u64::try_from(self.config.vanish_after.as_millis()).unwrap_or(u64::MAX));

        let id = Uuid::new_v4().to_string();
        let frame = Frame::message(&id, &content, reply.clone(), expiry_ms, vanish);
        self.transport.send(conn, &frame)?;

        let mut message = Message::new(id.clone(), content, Sender::Me, self.now());
        message.reply_to = reply;
        message.is_vanish = vanish;
        if let Some(ms) = expiry_ms {
            message = message.with_expiry(ms);
        }
        self.insert_message(key, message)?;
        Ok(id)
    }

    fn reply_ref(&self, key: &ConversationKey, id: &str) -> Result<ReplyRef> {
        let message = self
            .conversation(key)
            .and_then(|conv| conv.get(id))
            .ok_or_else(|| EngineError::UnknownMessage(id.to_string()))?;
        let counterpart = match key {
            ConversationKey::Primary => self.session.partner_profile(),
            ConversationKey::Secondary(peer) => self
                .secondaries
                .get(peer)
                .and_then(|link| link.profile.as_ref()),
        };
        let sender_name = match message.sender {
            Sender::Me => self.identity.profile.name.clone(),
            Sender::Stranger => counterpart
                .map(|p| p.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Stranger".to_string()),
            Sender::System => "System".to_string(),
        };
        Ok(ReplyRef {
            id: message.id.clone(),
            text: message.content.preview(),
            sender_name,
        })
    }

    pub fn set_typing(&mut self, key: &ConversationKey, active: bool) -> Result<()> {
        let conn = self.link_for(key)?;
        self.transport.send(conn, &Frame::typing(active))?;
        Ok(())
    }

    pub fn set_recording(&mut self, key: &ConversationKey, active: bool) -> Result<()> {
        let conn = self.link_for(key)?;
        self.transport.send(conn, &Frame::recording(active))?;
        Ok(())
    }

    pub fn react(&mut self, key: &ConversationKey, message_id: &str, emoji: &str) -> Result<()> {
        let conn = self.link_for(key)?;
        if self.conversation(key).and_then(|c| c.get(message_id)).is_none() {
            return Err(EngineError::UnknownMessage(message_id.to_string()));
        }
        self.transport.send(conn, &Frame::reaction(message_id, emoji))?;
        self.conversation_mut(key).react(
            message_id,
            Reaction {
                emoji: emoji.to_string(),
                sender: Sender::Me,
            },
        );
        Ok(())
    }

    /// Edit one of our own text messages in the primary conversation.
    pub fn edit_message(&mut self, message_id: &str, text: &str) -> Result<()> {
        let conn = self.link_for(&ConversationKey::Primary)?;
        let editable = match self.primary_conversation.get(message_id) {
            None => return Err(EngineError::UnknownMessage(message_id.to_string())),
            Some(m) => m.sender == Sender::Me && matches!(m.content, Content::Text(_)),
        };
        if !editable {
            return Err(EngineError::NotEditable(message_id.to_string()));
        }
        self.transport.send(conn, &Frame::edit(message_id, text))?;
        self.primary_conversation.edit(message_id, Sender::Me, text);
        Ok(())
    }

    pub fn set_vanish_mode(&mut self, enabled: bool) -> Result<()> {
        let conn = self.link_for(&ConversationKey::Primary)?;
        self.transport.send(conn, &Frame::vanish_mode(enabled))?;
        self.session.set_local_vanish(enabled);
        let (local, remote) = (self.session.local_vanish(), self.session.remote_vanish());
        self.emit(EngineEvent::VanishModeChanged { local, remote });
        Ok(())
    }

    pub fn send_friend_request(&mut self, key: &ConversationKey) -> Result<()> {
        let conn = self.link_for(key)?;
        self.transport
            .send(conn, &Frame::friend_request(&self.identity.profile))?;
        debug!(?key, "Friend request sent");
        Ok(())
    }

    /// Accept a pending request by its identity key and notify the peer when
    /// a link to it is open.
    pub fn accept_friend_request(&mut self, key: &str) -> Result<FriendRecord> {
        let now = self.now();
        let friend = self
            .friends
            .accept_request(key, now)
            .ok_or_else(|| EngineError::UnknownFriendRequest(key.to_string()))?;
        let result = self.friends.save(self.store.as_mut());
        self.persist("friends", result);

        match self.link_to(&friend.address) {
            Some(conn) => {
                if let Err(e) = self
                    .transport
                    .send(conn, &Frame::friend_accept(&self.identity.profile))
                {
                    warn!(error = %e, "Failed to send friend accept");
                }
            }
            None => debug!(friend = %friend.key, "Friend accepted without a live link"),
        }
        Ok(friend)
    }

    pub fn remove_friend(&mut self, key: &str) -> bool {
        let removed = self.friends.remove(key);
        if removed {
            let result = self.friends.save(self.store.as_mut());
            self.persist("friends", result);
        }
        removed
    }

    /// Dial a direct secondary link. A no-op if one is open or pending.
    pub fn open_secondary(&mut self, peer: &PeerAddress) -> Result<()> {
        if *peer == self.identity.address {
            return Err(pairchat_net::NetError::InvalidAddress(peer.to_string()).into());
        }
        if self.secondaries.contains_key(peer) || self.pending_secondaries.values().any(|p| p == peer) {
            return Ok(());
        }
        let conn = self.transport.connect(peer, ConnectionRole::Secondary)?;
        debug!(%conn, peer = %peer.short(), "Dialing secondary");
        self.pending_secondaries.insert(conn, peer.clone());
        Ok(())
    }

    pub fn close_secondary(&mut self, peer: &PeerAddress) -> Result<()> {
        let conn = self
            .secondaries
            .get(peer)
            .map(|link| link.conn)
            .ok_or_else(|| EngineError::NotConnected(ConversationKey::Secondary(peer.clone())))?;
        if let Err(e) = self.transport.send(conn, &Frame::disconnect()) {
            debug!(error = %e, "Could not send disconnect frame");
        }
        self.close_secondary_link(peer);
        Ok(())
    }

    /// Indicator state of a conversation.
    pub fn indicator(&self, key: &ConversationKey, indicator: Indicator) -> bool {
        self.conversation(key)
            .is_some_and(|conv| conv.indicator(indicator))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("address", &self.identity.address)
            .field("state", &self.session.state())
            .field("primary", &self.primary)
            .field("secondaries", &self.secondaries.len())
            .finish_non_exhaustive()
    }
}

/// Convenience for building a snapshot outside the runtime.
pub fn snapshot_of(records: impl IntoIterator<Item = pairchat_shared::types::PresenceRecord>) -> Snapshot {
    Arc::new(
        records
            .into_iter()
            .map(|record| (record.address.clone(), record))
            .collect(),
    )
}
