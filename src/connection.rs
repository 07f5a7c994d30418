use crate::debug;
use crate::error::{Result, SyncError};
use crate::protocol::{Message, MessagePayload, PeerId, RoomId, PROTOCOL_VERSION};
use crate::session::{DisconnectReason, PeerLink, Role, Session, SessionEvent, SessionState};
use crate::transport::{IncomingLinks, Signaling, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub slow_after: Duration,
    pub peer_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_poll_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            slow_after: Duration::from_secs(4),
            peer_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            handshake_poll_interval: Duration::from_millis(5),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_slow_after(mut self, grace: Duration) -> Self {
        self.slow_after = grace;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Connected { host_peer_id: PeerId },
    /// The room could not be reached. The caller should offer a different
    /// connection method rather than retry blindly.
    HostUnavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: PeerId,
    pub message: Message,
}

struct PendingLink<T> {
    channel: T,
    opened_at: Instant,
}

enum HandshakeStep<T> {
    Waiting(PendingLink<T>),
    Accepted { peer_id: PeerId, channel: T },
    Rejected,
}

/// A join in flight, detached from its [`ConnectionManager`].
pub struct JoinAttempt<S: Signaling> {
    signaling: Arc<S>,
    local_peer_id: PeerId,
    room_id: RoomId,
    config: ConnectionConfig,
    generation: u64,
}

impl<S: Signaling> JoinAttempt<S> {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Connects through signaling, says hello and waits for the welcome,
    /// bounded by `connect_timeout`.
    pub async fn connect(self) -> JoinResult<S::Link> {
        let link = open_host_link(&*self.signaling, &self.local_peer_id, &self.room_id, &self.config).await;
        JoinResult {
            room_id: self.room_id,
            generation: self.generation,
            link,
        }
    }
}

pub struct JoinResult<T> {
    room_id: RoomId,
    generation: u64,
    link: Result<(PeerId, T)>,
}

impl<T> JoinResult<T> {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

async fn open_host_link<S: Signaling>(
    signaling: &S,
    local_peer_id: &PeerId,
    room_id: &RoomId,
    config: &ConnectionConfig,
) -> Result<(PeerId, S::Link)> {
    let mut channel = signaling.connect(room_id).await?;
    channel.send(&Message::hello(local_peer_id.clone()))?;

    let poll_interval = config.handshake_poll_interval;
    let handshake = async {
        loop {
            match channel.receive() {
                Ok(Some(message)) => match message.payload {
                    MessagePayload::Welcome { host_peer_id } => return Ok(host_peer_id),
                    MessagePayload::Kicked { reason } => return Err(SyncError::HostUnavailable(reason)),
                    _ => {
                        tracing::debug!(
                            summary = %debug::message_summary(&message),
                            "ignoring message before welcome"
                        );
                    }
                },
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(e) if e.is_decode_failure() => {
                    tracing::warn!(error = %e, "discarding undecodable handshake message");
                }
                Err(e) => return Err(e),
            }
        }
    };

    let result = tokio::time::timeout(config.connect_timeout, handshake).await;
    match result {
        Ok(Ok(host_peer_id)) => Ok((host_peer_id, channel)),
        Ok(Err(e)) => {
            let _ = channel.close();
            Err(e)
        }
        Err(_) => {
            let _ = channel.close();
            Err(SyncError::HostUnavailable(format!(
                "no welcome from room {} within {:?}",
                room_id, config.connect_timeout
            )))
        }
    }
}

pub struct ConnectionManager<S: Signaling> {
    signaling: Arc<S>,
    config: ConnectionConfig,
    local_peer_id: PeerId,
    session: Option<Session<S::Link>>,
    incoming: Option<IncomingLinks<S::Link>>,
    pending: Vec<PendingLink<S::Link>>,
    host_peer_id: Option<PeerId>,
    events: Vec<SessionEvent>,
    next_nonce: u64,
    join_generation: u64,
}

impl<S: Signaling> ConnectionManager<S> {
    pub fn new(signaling: S, local_peer_id: PeerId, config: ConnectionConfig) -> Self {
        Self {
            signaling: Arc::new(signaling),
            config,
            local_peer_id,
            session: None,
            incoming: None,
            pending: Vec::new(),
            host_peer_id: None,
            events: Vec::new(),
            next_nonce: 1,
            join_generation: 0,
        }
    }

    pub async fn host_game(&mut self, room_id: RoomId) -> Result<RoomId> {
        self.dispose();

        let incoming = self.signaling.register(&room_id).await.map_err(|e| match e {
            SyncError::SignalingUnavailable(reason) => SyncError::SignalingUnavailable(reason),
            other => SyncError::SignalingUnavailable(other.to_string()),
        })?;

        tracing::info!(room = %room_id, peer = %self.local_peer_id, "hosting");

        self.incoming = Some(incoming);
        self.session = Some(Session::new(Role::Host, self.local_peer_id.clone(), room_id.clone()));
        Ok(room_id)
    }

    pub async fn join_game(&mut self, room_id: RoomId) -> JoinOutcome {
        let attempt = self.begin_join(room_id);
        let result = attempt.connect().await;
        self.complete_join(result)
    }

    /// Opens a joiner session in the `Joining` state. The returned attempt
    /// does the connect and handshake without borrowing the manager; hand
    /// its result to [`ConnectionManager::complete_join`].
    pub fn begin_join(&mut self, room_id: RoomId) -> JoinAttempt<S> {
        self.dispose();
        self.join_generation += 1;
        self.session = Some(Session::new(Role::Joiner, self.local_peer_id.clone(), room_id.clone()));

        JoinAttempt {
            signaling: Arc::clone(&self.signaling),
            local_peer_id: self.local_peer_id.clone(),
            room_id,
            config: self.config.clone(),
            generation: self.join_generation,
        }
    }

    /// Installs the host link if the attempt is still the current one.
    /// A join that was left, disposed or replaced meanwhile is closed.
    pub fn complete_join(&mut self, result: JoinResult<S::Link>) -> JoinOutcome {
        let JoinResult {
            room_id,
            generation,
            link,
        } = result;

        let current = generation == self.join_generation
            && self.state() == SessionState::Joining
            && self.room_id() == Some(&room_id);

        match link {
            Ok((host_peer_id, mut channel)) if !current => {
                tracing::debug!(room = %room_id, host = %host_peer_id, "discarding superseded join");
                let _ = channel.close();
                JoinOutcome::HostUnavailable {
                    reason: "join superseded".to_string(),
                }
            }
            Ok((host_peer_id, channel)) => {
                let now = Instant::now();
                let Some(session) = self.session.as_mut() else {
                    return JoinOutcome::HostUnavailable {
                        reason: "session closed while joining".to_string(),
                    };
                };

                session
                    .peers
                    .insert(host_peer_id.clone(), PeerLink::new(host_peer_id.clone(), channel, now));
                session.state = SessionState::Connected;
                self.host_peer_id = Some(host_peer_id.clone());
                self.events.push(SessionEvent::PeerConnected {
                    peer_id: host_peer_id.clone(),
                });

                tracing::info!(room = %room_id, host = %host_peer_id, "joined");
                JoinOutcome::Connected { host_peer_id }
            }
            Err(e) => {
                tracing::warn!(room = %room_id, error = %e, "join failed");
                if current {
                    self.session = None;
                }
                JoinOutcome::HostUnavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn accept_pending(&mut self, now: Instant) {
        if let Some(incoming) = self.incoming.as_mut() {
            while let Ok(channel) = incoming.try_recv() {
                self.pending.push(PendingLink {
                    channel,
                    opened_at: now,
                });
            }
        }

        let pending = std::mem::take(&mut self.pending);
        for link in pending {
            match self.advance_handshake(link, now) {
                HandshakeStep::Waiting(link) => self.pending.push(link),
                HandshakeStep::Accepted { peer_id, channel } => self.admit_peer(peer_id, channel, now),
                HandshakeStep::Rejected => {}
            }
        }
    }

    fn advance_handshake(&self, mut link: PendingLink<S::Link>, now: Instant) -> HandshakeStep<S::Link> {
        loop {
            match link.channel.receive() {
                Ok(Some(message)) => match message.payload {
                    MessagePayload::Hello {
                        peer_id,
                        protocol_version,
                    } => {
                        if protocol_version != PROTOCOL_VERSION {
                            tracing::warn!(
                                peer = %peer_id,
                                theirs = protocol_version,
                                ours = PROTOCOL_VERSION,
                                "refusing peer with mismatched protocol version"
                            );
                            let _ = link.channel.send(&Message::kicked(format!(
                                "protocol version {} not supported (host speaks {})",
                                protocol_version, PROTOCOL_VERSION
                            )));
                            let _ = link.channel.close();
                            return HandshakeStep::Rejected;
                        }

                        if peer_id == self.local_peer_id {
                            tracing::warn!(peer = %peer_id, "refusing peer using the host's own id");
                            let _ = link.channel.send(&Message::kicked("duplicate peer id".to_string()));
                            let _ = link.channel.close();
                            return HandshakeStep::Rejected;
                        }

                        return HandshakeStep::Accepted {
                            peer_id,
                            channel: link.channel,
                        };
                    }
                    _ => {
                        tracing::debug!(
                            summary = %debug::message_summary(&message),
                            "ignoring message before hello"
                        );
                    }
                },
                Ok(None) => break,
                Err(e) if e.is_decode_failure() => {
                    tracing::warn!(error = %e, "discarding undecodable handshake message");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "pending link closed before hello");
                    return HandshakeStep::Rejected;
                }
            }
        }

        if now.saturating_duration_since(link.opened_at) > self.config.connect_timeout {
            tracing::debug!("dropping pending link that never said hello");
            let _ = link.channel.close();
            return HandshakeStep::Rejected;
        }

        HandshakeStep::Waiting(link)
    }

    fn admit_peer(&mut self, peer_id: PeerId, channel: S::Link, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Some(mut previous) = session.peers.remove(&peer_id) {
            previous.close();
            self.events.push(SessionEvent::PeerDisconnected {
                peer_id: peer_id.clone(),
                reason: DisconnectReason::Replaced,
            });
        }

        let mut link = PeerLink::new(peer_id.clone(), channel, now);
        if let Err(e) = link.send(&Message::welcome(self.local_peer_id.clone()), now) {
            tracing::warn!(peer = %peer_id, error = %e, "failed to welcome peer");
            return;
        }

        session.peers.insert(peer_id.clone(), link);
        session.state = SessionState::Connected;

        tracing::info!(peer = %peer_id, peers = session.peers.len(), "peer connected");
        self.events.push(SessionEvent::PeerConnected { peer_id });
    }

    /// Drains every link. Returns game messages in per-peer arrival order.
    pub fn poll(&mut self, now: Instant) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return inbound;
        };

        let role = session.role;
        let mut ended: Vec<(PeerId, DisconnectReason)> = Vec::new();

        for link in session.peers.values_mut() {
            let mut end_reason = None;

            loop {
                match link.channel.receive() {
                    Ok(Some(message)) => {
                        link.last_message_at = now;
                        if link.slow {
                            link.slow = false;
                            self.events.push(SessionEvent::ConnectionRecovered {
                                peer_id: link.peer_id.clone(),
                            });
                        }

                        debug::log_message("recv", &link.peer_id, &message);

                        if !message.is_consistent() {
                            tracing::warn!(
                                peer = %link.peer_id,
                                header = ?message.msg_type(),
                                payload = ?message.payload.message_type(),
                                "discarding message with mismatched header"
                            );
                            continue;
                        }

                        match message.payload {
                            MessagePayload::Ping { nonce } => {
                                if let Err(e) = link.send(&Message::pong(nonce), now) {
                                    tracing::debug!(peer = %link.peer_id, error = %e, "pong failed");
                                }
                            }
                            MessagePayload::Pong { nonce } => {
                                if let Some((expected, sent_at)) = link.pending_ping {
                                    if expected == nonce {
                                        link.rtt = Some(now.saturating_duration_since(sent_at));
                                        link.pending_ping = None;
                                    }
                                }
                            }
                            MessagePayload::Hello { .. } | MessagePayload::Welcome { .. } => {
                                tracing::debug!(peer = %link.peer_id, "ignoring repeated handshake");
                            }
                            MessagePayload::Kicked { reason } if role == Role::Joiner => {
                                tracing::warn!(reason = %reason, "kicked by host");
                                self.events.push(SessionEvent::Kicked { reason });
                                end_reason = Some(DisconnectReason::Kicked);
                                break;
                            }
                            MessagePayload::HostLeft if role == Role::Joiner => {
                                tracing::info!(host = %link.peer_id, "host ended the session");
                                self.events.push(SessionEvent::HostLeft);
                                end_reason = Some(DisconnectReason::Left);
                                break;
                            }
                            _ => inbound.push(Inbound {
                                from: link.peer_id.clone(),
                                message,
                            }),
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_decode_failure() => {
                        tracing::warn!(peer = %link.peer_id, error = %e, "discarding undecodable message");
                    }
                    Err(e) => {
                        tracing::debug!(peer = %link.peer_id, error = %e, "link receive failed");
                        end_reason = Some(DisconnectReason::Closed);
                        break;
                    }
                }
            }

            if end_reason.is_none() && !link.channel.is_connected() {
                end_reason = Some(DisconnectReason::Closed);
            }

            if let Some(reason) = end_reason {
                ended.push((link.peer_id.clone(), reason));
            }
        }

        for (peer_id, reason) in ended {
            self.drop_peer(&peer_id, reason);
        }

        inbound
    }

    pub fn heartbeat(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for link in session.peers.values_mut() {
            if now.saturating_duration_since(link.last_sent_at) < self.config.heartbeat_interval {
                continue;
            }

            let nonce = self.next_nonce;
            self.next_nonce += 1;

            match link.send(&Message::ping(nonce), now) {
                Ok(()) => link.pending_ping = Some((nonce, now)),
                Err(e) => tracing::debug!(peer = %link.peer_id, error = %e, "heartbeat failed"),
            }
        }
    }

    pub fn check_liveness(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut timed_out = Vec::new();
        for link in session.peers.values_mut() {
            let silence = link.silence(now);

            if silence > self.config.peer_timeout {
                timed_out.push(link.peer_id.clone());
            } else if silence > self.config.slow_after && !link.slow {
                link.slow = true;
                tracing::warn!(peer = %link.peer_id, ?silence, "connection slow");
                self.events.push(SessionEvent::ConnectionSlow {
                    peer_id: link.peer_id.clone(),
                });
            }
        }

        for peer_id in timed_out {
            tracing::warn!(peer = %peer_id, error = %SyncError::PeerTimeout(peer_id.clone()), "dropping silent peer");
            self.drop_peer(&peer_id, DisconnectReason::Timeout);
        }
    }

    fn drop_peer(&mut self, peer_id: &PeerId, reason: DisconnectReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let Some(mut link) = session.peers.remove(peer_id) else {
            return;
        };
        link.close();

        match session.role {
            Role::Host => {
                if session.peers.is_empty() {
                    session.state = SessionState::Hosting;
                }
                tracing::info!(peer = %peer_id, ?reason, peers = session.peers.len(), "peer disconnected");
                self.events.push(SessionEvent::PeerDisconnected {
                    peer_id: peer_id.clone(),
                    reason,
                });
            }
            Role::Joiner => {
                session.state = SessionState::Disconnected;
                self.host_peer_id = None;
                if matches!(reason, DisconnectReason::Timeout | DisconnectReason::Closed) {
                    tracing::warn!(host = %peer_id, ?reason, "lost connection to host");
                    self.events.push(SessionEvent::HostLost);
                }
            }
        }
    }

    pub fn send_to(&mut self, peer_id: &PeerId, message: &Message, now: Instant) -> Result<()> {
        let link = self
            .session
            .as_mut()
            .and_then(|session| session.peers.get_mut(peer_id))
            .ok_or(SyncError::NotConnected)?;

        debug::log_message("send", peer_id, message);
        link.send(message, now)
    }

    pub fn send_to_host(&mut self, message: &Message, now: Instant) -> Result<()> {
        let host = self.host_peer_id.clone().ok_or(SyncError::NotConnected)?;
        self.send_to(&host, message, now)
    }

    /// Sends to every connected peer. Returns how many sends succeeded; a
    /// failed peer is picked up as closed by the next [`poll`](Self::poll).
    pub fn broadcast(&mut self, message: &Message, now: Instant) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };

        let mut delivered = 0;
        for link in session.peers.values_mut().filter(|link| link.connected) {
            debug::log_message("send", &link.peer_id, message);
            match link.send(message, now) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer = %link.peer_id, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    pub fn kick_player(&mut self, peer_id: &PeerId, reason: &str, now: Instant) -> Result<()> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }

        let Some(session) = self.session.as_mut() else {
            return Err(SyncError::NotConnected);
        };
        let link = session.peers.get_mut(peer_id).ok_or(SyncError::NotConnected)?;

        if let Err(e) = link.send(&Message::kicked(reason.to_string()), now) {
            tracing::debug!(peer = %peer_id, error = %e, "kick notice not delivered");
        }

        tracing::info!(peer = %peer_id, reason, "kicking player");
        self.drop_peer(peer_id, DisconnectReason::Kicked);
        Ok(())
    }

    pub fn leave(&mut self, now: Instant) {
        if self.is_host() {
            self.broadcast(&Message::host_left(), now);
        }

        self.teardown();
        if let Some(session) = self.session.as_mut() {
            session.state = SessionState::Left;
        }
    }

    pub fn dispose(&mut self) {
        self.teardown();
        self.session = None;
        self.events.clear();
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close_all();
        }
        for mut link in self.pending.drain(..) {
            let _ = link.channel.close();
        }
        self.incoming = None;
        self.host_peer_id = None;
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn session(&self) -> Option<&Session<S::Link>> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|session| session.role)
    }

    pub fn is_host(&self) -> bool {
        self.role() == Some(Role::Host)
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.session.as_ref().map(|session| &session.room_id)
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn host_peer_id(&self) -> Option<&PeerId> {
        self.host_peer_id.as_ref()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.session
            .as_ref()
            .map(|session| session.connected_peer_ids())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.peers.len())
            .unwrap_or(0)
    }

    pub fn is_peer_connected(&self, peer_id: &PeerId) -> bool {
        self.session
            .as_ref()
            .map(|session| session.peers.contains_key(peer_id))
            .unwrap_or(false)
    }

    pub fn peer_rtt(&self, peer_id: &PeerId) -> Option<Duration> {
        self.session
            .as_ref()
            .and_then(|session| session.peers.get(peer_id))
            .and_then(|link| link.rtt)
    }

    pub fn get_config(&self) -> &ConnectionConfig {
        &self.config
    }
}
