use crate::error::Result;
use crate::protocol::{Message, PeerId, RoomId};
use crate::transport::Transport;
use ahash::AHashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hosting,
    Joining,
    Connected,
    /// Lost the link without either side leaving. Persisted room ids are kept.
    Disconnected,
    /// The local user left. Persisted room ids are cleared.
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    Closed,
    Kicked,
    Replaced,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerConnected { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId, reason: DisconnectReason },
    ConnectionSlow { peer_id: PeerId },
    ConnectionRecovered { peer_id: PeerId },
    /// A joiner lost its host after being connected. Resumable.
    HostLost,
    HostLeft,
    Kicked { reason: String },
    GameStarted,
}

pub struct PeerLink<T: Transport> {
    pub peer_id: PeerId,
    pub channel: T,
    pub last_message_at: Instant,
    pub last_sent_at: Instant,
    pub connected: bool,
    pub slow: bool,
    pub rtt: Option<Duration>,
    pub(crate) pending_ping: Option<(u64, Instant)>,
}

impl<T: Transport> PeerLink<T> {
    pub fn new(peer_id: PeerId, channel: T, now: Instant) -> Self {
        Self {
            peer_id,
            channel,
            last_message_at: now,
            last_sent_at: now,
            connected: true,
            slow: false,
            rtt: None,
            pending_ping: None,
        }
    }

    pub fn send(&mut self, message: &Message, now: Instant) -> Result<()> {
        self.channel.send(message)?;
        self.last_sent_at = now;
        Ok(())
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_message_at)
    }

    pub fn close(&mut self) {
        self.connected = false;
        if let Err(e) = self.channel.close() {
            tracing::debug!(peer = %self.peer_id, error = %e, "error closing link");
        }
    }
}

pub struct Session<T: Transport> {
    pub role: Role,
    pub local_peer_id: PeerId,
    pub room_id: RoomId,
    pub peers: AHashMap<PeerId, PeerLink<T>>,
    pub state: SessionState,
}

impl<T: Transport> Session<T> {
    pub fn new(role: Role, local_peer_id: PeerId, room_id: RoomId) -> Self {
        let state = match role {
            Role::Host => SessionState::Hosting,
            Role::Joiner => SessionState::Joining,
        };

        Self {
            role,
            local_peer_id,
            room_id,
            peers: AHashMap::new(),
            state,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn connected_peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|link| link.connected)
            .map(|link| link.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn close_all(&mut self) {
        for link in self.peers.values_mut() {
            link.close();
        }
        self.peers.clear();
    }
}
