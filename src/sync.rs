use crate::codec::{decode_vector, encode_vector};
use crate::connection::{ConnectionConfig, ConnectionManager, Inbound, JoinAttempt, JoinOutcome, JoinResult};
use crate::debug;
use crate::error::{Result, SyncError};
use crate::identity::{generate_room_id, IdentityStore, PersistedIdentity};
use crate::protocol::{EnemyId, GameStatePayload, InputFrame, Message, MessagePayload, PeerId, RoomId};
use crate::reconcile::{Correction, ReconcileConfig, StateReconciler};
use crate::remote::RemotePlayerManager;
use crate::serialization::{BinaryFormat, BinarySerializer};
use crate::session::{DisconnectReason, Role, SessionEvent, SessionState};
use crate::snapshot::{
    is_newer_tick, AvatarPose, EnemySnapshot, GameStateSnapshot, PlayerSnapshot, SnapshotBuilder,
};
use crate::transport::Signaling;
use glam::Vec3;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub broadcast_interval: Duration,
    pub full_sync_every: u32,
    /// How often the runtime drains links and runs heartbeat and liveness.
    pub poll_interval: Duration,
    pub format: BinaryFormat,
    pub spawn_grace: Duration,
    pub reconcile: ReconcileConfig,
    pub connection: ConnectionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(33),
            full_sync_every: 30,
            poll_interval: Duration::from_millis(5),
            format: BinaryFormat::MessagePack,
            spawn_grace: Duration::from_secs(1),
            reconcile: ReconcileConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }

    pub fn with_full_sync_every(mut self, ticks: u32) -> Self {
        self.full_sync_every = ticks;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_format(mut self, format: BinaryFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_spawn_grace(mut self, grace: Duration) -> Self {
        self.spawn_grace = grace;
        self
    }

    pub fn with_reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile = config;
        self
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }
}

/// The host's authoritative game world, as seen by the sync layer.
pub trait HostSimulation: Send {
    /// Called for every participant entering the session, including the
    /// host itself when hosting starts.
    fn on_peer_joined(&mut self, peer_id: &PeerId);

    fn on_peer_left(&mut self, peer_id: &PeerId);

    fn place_player(&mut self, peer_id: &PeerId, position: Vec3);

    /// `move_x` and `move_z` are already validated and clamped to [-1, 1].
    fn apply_movement(&mut self, peer_id: &PeerId, move_x: f32, move_z: f32);

    fn request_jump(&mut self, peer_id: &PeerId);

    /// Returns whether the kill was accepted. Unknown ids must return false.
    fn kill_enemy(&mut self, enemy_id: &EnemyId) -> bool;

    fn players(&self) -> Vec<PlayerSnapshot>;

    fn enemies(&self) -> Vec<EnemySnapshot>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Hosting { room_id: RoomId },
    Joined { room_id: RoomId, host_peer_id: PeerId },
    HostUnavailable { reason: String },
    NothingToResume,
}

impl ResumeOutcome {
    pub(crate) fn from_join(room_id: RoomId, outcome: JoinOutcome) -> Self {
        match outcome {
            JoinOutcome::Connected { host_peer_id } => ResumeOutcome::Joined {
                room_id,
                host_peer_id,
            },
            JoinOutcome::HostUnavailable { reason } => ResumeOutcome::HostUnavailable { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    Host(RoomId),
    Join(RoomId),
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub snapshots_sent: u64,
    pub snapshot_bytes_sent: u64,
    pub snapshots_applied: u64,
    pub snapshots_discarded: u64,
    pub inputs_sent: u64,
    pub inputs_applied: u64,
    pub inputs_rejected: u64,
    pub kills_accepted: u64,
    pub kills_ignored: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingAuthority {
    position: Vec3,
    yaw: f32,
    full_sync: bool,
}

pub struct SyncManager<S: Signaling, W: HostSimulation> {
    connection: ConnectionManager<S>,
    simulation: W,
    identity_store: Box<dyn IdentityStore>,
    identity: PersistedIdentity,
    config: SyncConfig,
    serializer: BinarySerializer,
    builder: SnapshotBuilder,
    reconciler: StateReconciler,
    remote: RemotePlayerManager,
    next_broadcast: Option<Instant>,
    running: bool,
    initial_position_sent: bool,
    last_applied_tick: Option<u32>,
    pending_authority: Option<PendingAuthority>,
    events: Vec<SessionEvent>,
    stats: SyncStats,
}

impl<S: Signaling, W: HostSimulation> SyncManager<S, W> {
    /// Loads the persisted identity once; it is not re-read for the lifetime
    /// of the manager.
    pub fn new(
        signaling: S,
        simulation: W,
        mut identity_store: impl IdentityStore + 'static,
        config: SyncConfig,
    ) -> Result<Self> {
        let identity = identity_store.load()?;
        tracing::debug!(peer = %identity.local_peer_id, "loaded identity");

        Ok(Self {
            connection: ConnectionManager::new(
                signaling,
                identity.local_peer_id.clone(),
                config.connection.clone(),
            ),
            simulation,
            identity_store: Box::new(identity_store),
            identity,
            serializer: BinarySerializer::new(config.format),
            builder: SnapshotBuilder::new(config.full_sync_every),
            reconciler: StateReconciler::new(config.reconcile),
            remote: RemotePlayerManager::new(config.spawn_grace),
            next_broadcast: None,
            running: false,
            initial_position_sent: false,
            last_applied_tick: None,
            pending_authority: None,
            events: Vec::new(),
            stats: SyncStats::default(),
            config,
        })
    }

    pub async fn host_game(&mut self, previous_room_id: Option<RoomId>) -> Result<RoomId> {
        self.reset_session_state();

        let room_id = previous_room_id.unwrap_or_else(generate_room_id);
        let room_id = self.connection.host_game(room_id).await?;

        let local = self.identity.local_peer_id.clone();
        self.simulation.on_peer_joined(&local);

        self.identity.hosted_room_id = Some(room_id.clone());
        self.identity.joined_room_id = None;
        self.persist_identity();

        Ok(room_id)
    }

    pub async fn join_game(&mut self, room_id: RoomId) -> JoinOutcome {
        let attempt = self.begin_join(room_id);
        let result = attempt.connect().await;
        self.complete_join(result)
    }

    /// First half of [`join_game`](Self::join_game). The manager sits in
    /// `Joining` until the attempt's result is passed to
    /// [`complete_join`](Self::complete_join).
    pub fn begin_join(&mut self, room_id: RoomId) -> JoinAttempt<S> {
        self.reset_session_state();
        self.connection.begin_join(room_id)
    }

    pub fn complete_join(&mut self, result: JoinResult<S::Link>) -> JoinOutcome {
        let room_id = result.room_id().clone();
        let outcome = self.connection.complete_join(result);

        if let JoinOutcome::Connected { .. } = outcome {
            self.identity.joined_room_id = Some(room_id);
            self.identity.hosted_room_id = None;
            self.persist_identity();
            self.process_session_events(Instant::now());
        }

        outcome
    }

    pub fn resume_target(&self) -> Option<ResumeTarget> {
        if let Some(room_id) = &self.identity.hosted_room_id {
            return Some(ResumeTarget::Host(room_id.clone()));
        }
        self.identity
            .joined_room_id
            .as_ref()
            .map(|room_id| ResumeTarget::Join(room_id.clone()))
    }

    pub async fn resume(&mut self) -> Result<ResumeOutcome> {
        match self.resume_target() {
            Some(ResumeTarget::Host(room_id)) => {
                tracing::info!(room = %room_id, "resuming hosted room");
                let room_id = self.host_game(Some(room_id)).await?;
                Ok(ResumeOutcome::Hosting { room_id })
            }
            Some(ResumeTarget::Join(room_id)) => {
                tracing::info!(room = %room_id, "rejoining room");
                let outcome = self.join_game(room_id.clone()).await;
                Ok(ResumeOutcome::from_join(room_id, outcome))
            }
            None => Ok(ResumeOutcome::NothingToResume),
        }
    }

    pub fn poll_network(&mut self, now: Instant) {
        if self.connection.is_host() {
            self.connection.accept_pending(now);
            self.process_session_events(now);
        }

        for inbound in self.connection.poll(now) {
            self.dispatch(inbound, now);
        }

        self.connection.heartbeat(now);
        self.connection.check_liveness(now);
        self.process_session_events(now);
    }

    fn dispatch(&mut self, inbound: Inbound, now: Instant) {
        let Inbound { from, message } = inbound;
        let msg_type = message.payload.message_type();

        let allowed = if self.connection.is_host() {
            msg_type.is_joiner_originated()
        } else {
            msg_type.is_host_originated()
        };
        if !allowed {
            tracing::warn!(peer = %from, ?msg_type, "dropping message sent in the wrong direction");
            return;
        }

        match message.payload {
            MessagePayload::Input(frame) => {
                if let Err(e) = self.process_player_input(&from, frame) {
                    tracing::warn!(peer = %from, error = %e, "discarding input");
                }
            }
            MessagePayload::InitialPosition { position } => {
                self.simulation.place_player(&from, decode_vector(position));
            }
            MessagePayload::EnemyKilled { enemy_id } => self.handle_enemy_killed(&from, &enemy_id),
            MessagePayload::GameState(payload) => {
                if let Err(e) = self.apply_snapshot(&payload, now) {
                    tracing::warn!(peer = %from, error = %e, "discarding snapshot");
                }
            }
            MessagePayload::StartGame => {
                if !self.running {
                    tracing::info!("host started the game");
                    self.running = true;
                    self.events.push(SessionEvent::GameStarted);
                }
            }
            other => {
                tracing::debug!(peer = %from, msg_type = ?other.message_type(), "unhandled message");
            }
        }
    }

    fn process_session_events(&mut self, now: Instant) {
        for event in self.connection.take_events() {
            match &event {
                SessionEvent::PeerConnected { peer_id } if self.connection.is_host() => {
                    self.simulation.on_peer_joined(peer_id);
                    self.builder.request_full_sync();
                    if self.next_broadcast.is_none() {
                        tracing::debug!("arming broadcast timer");
                        self.next_broadcast = Some(now);
                    }
                    if self.running {
                        if let Err(e) = self.connection.send_to(peer_id, &Message::start_game(), now) {
                            tracing::warn!(peer = %peer_id, error = %e, "failed to send startGame");
                        }
                    }
                }
                SessionEvent::PeerConnected { .. } => {
                    self.initial_position_sent = false;
                    self.last_applied_tick = None;
                    self.pending_authority = None;
                }
                SessionEvent::PeerDisconnected { peer_id, reason } => {
                    self.simulation.on_peer_left(peer_id);
                    if *reason != DisconnectReason::Replaced && self.connection.peer_count() == 0 {
                        tracing::debug!("releasing broadcast timer");
                        self.next_broadcast = None;
                    }
                }
                SessionEvent::HostLost => {
                    self.running = false;
                    self.pending_authority = None;
                    self.remote.clear();
                }
                SessionEvent::HostLeft | SessionEvent::Kicked { .. } => {
                    self.running = false;
                    self.pending_authority = None;
                    self.remote.clear();
                    self.identity.joined_room_id = None;
                    self.persist_identity();
                }
                _ => {}
            }
            self.events.push(event);
        }
    }

    pub fn process_player_input(&mut self, peer_id: &PeerId, frame: InputFrame) -> Result<()> {
        if !self.connection.is_host() {
            return Err(SyncError::NotHost);
        }

        let frame = match frame.validated() {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.inputs_rejected += 1;
                return Err(e);
            }
        };

        self.simulation.apply_movement(peer_id, frame.move_x, frame.move_z);
        if frame.jump_pressed {
            self.simulation.request_jump(peer_id);
        }

        self.stats.inputs_applied += 1;
        Ok(())
    }

    fn handle_enemy_killed(&mut self, from: &PeerId, enemy_id: &EnemyId) {
        if self.simulation.kill_enemy(enemy_id) {
            tracing::debug!(peer = %from, enemy = %enemy_id, "kill accepted");
            self.stats.kills_accepted += 1;
        } else {
            tracing::debug!(peer = %from, enemy = %enemy_id, "ignoring kill of unknown enemy");
            self.stats.kills_ignored += 1;
        }
    }

    pub fn start_game(&mut self, now: Instant) -> Result<()> {
        if !self.connection.is_host() {
            return Err(SyncError::NotHost);
        }

        self.running = true;
        self.connection.broadcast(&Message::start_game(), now);
        self.events.push(SessionEvent::GameStarted);
        tracing::info!(peers = self.connection.peer_count(), "game started");
        Ok(())
    }

    /// When the next snapshot is due, or `None` while no peer is connected.
    pub fn next_broadcast_due(&self) -> Option<Instant> {
        self.next_broadcast
    }

    pub fn host_tick(&mut self, now: Instant) -> Option<GameStateSnapshot> {
        let due = self.next_broadcast?;
        if now < due || !self.connection.is_host() {
            return None;
        }

        let connected = self.connection.connected_peers();
        let snapshot = self.builder.build(
            &self.identity.local_peer_id,
            &connected,
            self.simulation.players(),
            self.simulation.enemies(),
        );
        let payload = snapshot.to_payload();

        self.record_snapshot_size(&payload);
        let delivered = self.connection.broadcast(&Message::game_state(payload), now);
        self.stats.snapshots_sent += 1;
        tracing::trace!(tick = snapshot.tick_seq, full_sync = snapshot.full_sync, delivered, "broadcast");

        let interval = self.config.broadcast_interval;
        let next = due + interval;
        self.next_broadcast = Some(if next <= now { now + interval } else { next });

        Some(snapshot)
    }

    fn record_snapshot_size(&mut self, payload: &GameStatePayload) {
        match self.serializer.serialize_snapshot(payload) {
            Ok(bytes) => {
                self.stats.snapshot_bytes_sent += bytes.len() as u64;
                debug::trace_snapshot(payload, bytes.len());
            }
            Err(e) => tracing::debug!(error = %e, "could not size snapshot"),
        }
    }

    /// Joiner per-frame call: sends the opening position once, forwards
    /// input while the game runs, then corrects `local` toward the latest
    /// authoritative pose.
    pub fn joiner_frame(
        &mut self,
        input: InputFrame,
        local: &mut AvatarPose,
        now: Instant,
    ) -> Result<Option<Correction>> {
        if self.connection.role() != Some(Role::Joiner)
            || self.connection.state() != SessionState::Connected
        {
            return Ok(None);
        }

        if !self.initial_position_sent {
            match encode_vector(local.position) {
                Ok(position) => {
                    self.send_to_host(&Message::initial_position(position), now);
                    self.initial_position_sent = true;
                }
                Err(e) => tracing::warn!(error = %e, "cannot announce initial position"),
            }
        }

        let mut outcome = Ok(None);

        if self.running {
            match input.validated() {
                Ok(frame) => {
                    self.send_to_host(&Message::input(frame), now);
                    self.stats.inputs_sent += 1;
                }
                Err(e) => {
                    self.stats.inputs_rejected += 1;
                    outcome = Err(e);
                }
            }
        }

        if let Some(pending) = self.pending_authority.take() {
            match self
                .reconciler
                .reconcile(local, pending.position, Some(pending.yaw), pending.full_sync)
            {
                Ok(correction) => {
                    if outcome.is_ok() {
                        outcome = Ok(Some(correction));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping reconciliation");
                    outcome = Err(e);
                }
            }
        }

        outcome
    }

    fn send_to_host(&mut self, message: &Message, now: Instant) {
        if let Err(e) = self.connection.send_to_host(message, now) {
            tracing::debug!(error = %e, "send to host failed");
        }
    }

    /// Joiner snapshot intake. Decodes the whole snapshot before touching
    /// any state; stale or duplicate ticks are dropped.
    pub fn apply_snapshot(&mut self, payload: &GameStatePayload, now: Instant) -> Result<()> {
        let snapshot = match GameStateSnapshot::from_payload(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.snapshots_discarded += 1;
                return Err(e);
            }
        };

        if let Some(last) = self.last_applied_tick {
            if !is_newer_tick(snapshot.tick_seq, last) {
                tracing::debug!(tick = snapshot.tick_seq, last, "dropping stale snapshot");
                self.stats.snapshots_discarded += 1;
                return Ok(());
            }
        }
        self.last_applied_tick = Some(snapshot.tick_seq);

        let local = &self.identity.local_peer_id;
        let mut others = Vec::with_capacity(snapshot.players.len());

        for (peer_id, player) in &snapshot.players {
            if peer_id == local {
                let carried = self.pending_authority.map(|p| p.full_sync).unwrap_or(false);
                self.pending_authority = Some(PendingAuthority {
                    position: player.position,
                    yaw: player.yaw,
                    full_sync: snapshot.full_sync || carried,
                });
                continue;
            }

            self.remote.update_player(player, now)?;
            others.push(peer_id.clone());
        }

        if snapshot.full_sync {
            for dropped in self.remote.retain_players(&others) {
                tracing::debug!(peer = %dropped, "remote player left");
            }
        }

        let changes = self.remote.update_enemies_from_host(
            &snapshot.enemies,
            &snapshot.removed_enemy_ids,
            snapshot.full_sync,
            now,
        );
        if !changes.is_empty() {
            tracing::trace!(spawned = changes.spawned.len(), removed = changes.removed.len(), "enemy replicas changed");
        }

        self.stats.snapshots_applied += 1;
        Ok(())
    }

    pub fn report_enemy_killed(&mut self, enemy_id: EnemyId, now: Instant) -> Result<()> {
        match self.connection.role() {
            Some(Role::Host) => {
                let local = self.identity.local_peer_id.clone();
                self.handle_enemy_killed(&local, &enemy_id);
                Ok(())
            }
            Some(Role::Joiner) => self.connection.send_to_host(&Message::enemy_killed(enemy_id), now),
            None => Err(SyncError::NotConnected),
        }
    }

    pub fn kick_player(&mut self, peer_id: &PeerId, reason: &str, now: Instant) -> Result<()> {
        self.connection.kick_player(peer_id, reason, now)?;
        self.process_session_events(now);
        Ok(())
    }

    pub fn leave_game(&mut self, now: Instant) {
        tracing::info!(room = ?self.connection.room_id(), "leaving game");
        self.connection.leave(now);
        self.clear_runtime_state();

        self.identity.hosted_room_id = None;
        self.identity.joined_room_id = None;
        self.persist_identity();
    }

    /// Tears down links and timers. Persisted room ids are kept.
    pub fn dispose(&mut self) {
        self.connection.dispose();
        self.clear_runtime_state();
    }

    fn reset_session_state(&mut self) {
        self.connection.dispose();
        self.clear_runtime_state();
        self.builder.reset();
        self.initial_position_sent = false;
        self.last_applied_tick = None;
        self.events.clear();
    }

    fn clear_runtime_state(&mut self) {
        self.next_broadcast = None;
        self.running = false;
        self.pending_authority = None;
        self.remote.clear();
    }

    fn persist_identity(&mut self) {
        if let Err(e) = self.identity_store.save(&self.identity) {
            tracing::warn!(error = %e, "failed to persist identity");
        }
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn role(&self) -> Option<Role> {
        self.connection.role()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.connection.room_id()
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.identity.local_peer_id
    }

    pub fn identity(&self) -> &PersistedIdentity {
        &self.identity
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connection.connected_peers()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn remote(&self) -> &RemotePlayerManager {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut RemotePlayerManager {
        &mut self.remote
    }

    pub fn simulation(&self) -> &W {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut W {
        &mut self.simulation
    }

    pub fn connection(&self) -> &ConnectionManager<S> {
        &self.connection
    }

    pub fn get_stats(&self) -> SyncStats {
        self.stats.clone()
    }

    pub fn get_config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_rotation;
    use crate::identity::MemoryIdentityStore;
    use crate::protocol::{EnemyState, MessageHeader, MessageType};
    use crate::transport::MemorySignaling;
    use crate::world::SimpleWorld;

    type Manager = SyncManager<MemorySignaling, SimpleWorld>;

    fn identity(peer: &str) -> MemoryIdentityStore {
        MemoryIdentityStore::with_identity(PersistedIdentity {
            local_peer_id: peer.to_string(),
            hosted_room_id: None,
            joined_room_id: None,
        })
    }

    fn manager(signaling: &MemorySignaling, store: MemoryIdentityStore) -> Manager {
        SyncManager::new(signaling.clone(), SimpleWorld::new(), store, SyncConfig::default()).unwrap()
    }

    async fn join(host: &mut Manager, joiner: &mut Manager, room: &RoomId) -> JoinOutcome {
        let accept = async {
            for _ in 0..1000 {
                host.poll_network(Instant::now());
                if !host.connected_peers().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };

        let (outcome, _) = tokio::join!(joiner.join_game(room.clone()), accept);
        outcome
    }

    async fn session() -> (Manager, Manager, MemoryIdentityStore) {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let joiner_store = identity("joiner");
        let mut host = manager(&signaling, identity("host"));
        let mut joiner = manager(&signaling, joiner_store.clone());

        let room = host.host_game(None).await.unwrap();
        let outcome = join(&mut host, &mut joiner, &room).await;
        assert!(matches!(outcome, JoinOutcome::Connected { .. }));

        host.take_events();
        joiner.take_events();
        (host, joiner, joiner_store)
    }

    #[tokio::test]
    async fn test_host_game_persists_room() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let store = identity("host");
        let mut host = manager(&signaling, store.clone());

        let room = host.host_game(None).await.unwrap();
        assert_eq!(room.len(), 6);
        assert_eq!(host.state(), SessionState::Hosting);
        assert_eq!(store.snapshot().unwrap().hosted_room_id, Some(room));
        assert!(host.simulation().player("host").is_some());
    }

    #[tokio::test]
    async fn test_host_game_reuses_previous_room() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let mut host = manager(&signaling, identity("host"));

        let room = host.host_game(Some("KEEPME".to_string())).await.unwrap();
        assert_eq!(room, "KEEPME");
    }

    #[tokio::test]
    async fn test_no_broadcast_without_peers() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let mut host = manager(&signaling, identity("host"));
        host.host_game(None).await.unwrap();

        let now = Instant::now();
        assert_eq!(host.next_broadcast_due(), None);
        assert!(host.host_tick(now).is_none());
        assert!(host.host_tick(now + Duration::from_secs(1)).is_none());
        assert_eq!(host.get_stats().snapshots_sent, 0);
    }

    #[tokio::test]
    async fn test_timer_armed_on_connect_and_released_on_leave() {
        let (mut host, mut joiner, _) = session().await;
        assert!(host.next_broadcast_due().is_some());
        assert_eq!(host.state(), SessionState::Connected);

        joiner.leave_game(Instant::now());
        // Joiner links close without a farewell; the host sees the link drop.
        host.poll_network(Instant::now());

        assert!(host.connected_peers().is_empty());
        assert_eq!(host.next_broadcast_due(), None);
        assert_eq!(host.state(), SessionState::Hosting);
    }

    #[tokio::test]
    async fn test_first_tick_after_connect_is_full_sync() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();

        let first = host.host_tick(now).unwrap();
        assert!(first.full_sync);
        assert_eq!(first.tick_seq, 1);

        let second = host.host_tick(now + Duration::from_millis(33)).unwrap();
        assert!(!second.full_sync);

        joiner.poll_network(now + Duration::from_millis(40));
        assert_eq!(joiner.get_stats().snapshots_applied, 2);
    }

    #[tokio::test]
    async fn test_host_tick_respects_interval() {
        let (mut host, _joiner, _) = session().await;
        let now = Instant::now();

        assert!(host.host_tick(now).is_some());
        assert!(host.host_tick(now + Duration::from_millis(10)).is_none());
        assert!(host.host_tick(now + Duration::from_millis(33)).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_routes_self_and_others() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();

        host.simulation_mut().place_player(&"joiner".to_string(), Vec3::new(0.0, 1.0, 0.0));
        host.simulation_mut().place_player(&"host".to_string(), Vec3::new(5.0, 0.0, 5.0));
        host.simulation_mut().spawn_enemy("e1".to_string(), Vec3::new(2.0, 0.0, 2.0), 10.0);
        host.host_tick(now).unwrap();

        joiner.poll_network(now);
        assert!(joiner.remote().player("host").is_some());
        assert!(joiner.remote().player("joiner").is_none());
        assert_eq!(joiner.remote().enemy_ids(), vec!["e1".to_string()]);

        let mut local = AvatarPose::new(Vec3::new(0.5, 1.0, 0.0), 0.0);
        let correction = joiner.joiner_frame(InputFrame::default(), &mut local, now).unwrap();

        assert_eq!(correction, Some(Correction::Snapped));
        assert!((local.position - Vec3::new(0.0, 1.0, 0.0)).length() < 0.001);
    }

    #[tokio::test]
    async fn test_initial_position_sent_once() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();
        let mut local = AvatarPose::new(Vec3::new(7.0, 0.0, -3.0), 0.0);

        joiner.joiner_frame(InputFrame::default(), &mut local, now).unwrap();
        local.position = Vec3::new(100.0, 0.0, 0.0);
        joiner.joiner_frame(InputFrame::default(), &mut local, now).unwrap();
        host.poll_network(now);

        let placed = host.simulation().player("joiner").unwrap();
        assert!((placed.position - Vec3::new(7.0, 0.0, -3.0)).length() < 0.001);
    }

    #[tokio::test]
    async fn test_input_flows_only_while_running() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();
        let mut local = AvatarPose::default();
        let forward = InputFrame::new(0.0, 1.0, false);

        joiner.joiner_frame(forward, &mut local, now).unwrap();
        host.poll_network(now);
        assert_eq!(host.get_stats().inputs_applied, 0);

        host.start_game(now).unwrap();
        joiner.poll_network(now);
        assert!(joiner.is_running());
        assert!(joiner.take_events().contains(&SessionEvent::GameStarted));

        joiner.joiner_frame(forward, &mut local, now).unwrap();
        host.poll_network(now);
        assert_eq!(host.get_stats().inputs_applied, 1);
        assert!(host.simulation().player("joiner").unwrap().position.z > 0.0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let (mut host, _joiner, _) = session().await;

        let result = host.process_player_input(&"joiner".to_string(), InputFrame::new(f32::NAN, 0.0, false));
        assert!(matches!(result, Err(SyncError::InvalidInput(_))));
        assert_eq!(host.get_stats().inputs_rejected, 1);

        host.process_player_input(&"joiner".to_string(), InputFrame::new(5.0, 0.0, true))
            .unwrap();
        let player = host.simulation().player("joiner").unwrap();
        assert_eq!(player.animation, crate::protocol::AnimationTag::Jump);
    }

    #[tokio::test]
    async fn test_unknown_enemy_kill_ignored() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();
        host.simulation_mut().spawn_enemy("e1".to_string(), Vec3::ZERO, 5.0);
        host.host_tick(now).unwrap();

        joiner.report_enemy_killed("e7".to_string(), now).unwrap();
        host.poll_network(now);

        let snapshot = host.host_tick(now + Duration::from_millis(33)).unwrap();
        assert!(!snapshot.removed_enemy_ids.contains(&"e7".to_string()));
        assert!(snapshot.removed_enemy_ids.is_empty());
        assert_eq!(host.get_stats().kills_ignored, 1);
    }

    #[tokio::test]
    async fn test_accepted_kill_reaches_removed_ids() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();
        host.simulation_mut().spawn_enemy("e1".to_string(), Vec3::ZERO, 5.0);
        host.host_tick(now).unwrap();
        joiner.poll_network(now);
        assert_eq!(joiner.remote().enemy_count(), 1);

        joiner.report_enemy_killed("e1".to_string(), now).unwrap();
        // Only the host's snapshot removes it from the joiner's replica.
        assert_eq!(joiner.remote().enemy_count(), 1);
        assert!(joiner.remote().enemy("e1").is_some());

        host.poll_network(now);
        let snapshot = host.host_tick(now + Duration::from_millis(33)).unwrap();
        assert_eq!(snapshot.removed_enemy_ids, vec!["e1".to_string()]);

        joiner.poll_network(now);
        assert_eq!(joiner.remote().enemy_count(), 0);
    }

    #[tokio::test]
    async fn test_joiner_cannot_author_snapshots() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();

        // A joiner pushing a gameState at the host is dropped by direction.
        let forged = GameStatePayload {
            tick_seq: 99,
            full_sync: true,
            players: vec![],
            enemies: vec![],
            removed_ids: vec![],
        };
        joiner
            .connection
            .send_to_host(&Message::game_state(forged), now)
            .unwrap();
        host.poll_network(now);

        assert_eq!(host.get_stats().snapshots_applied, 0);
        assert!(matches!(
            joiner.process_player_input(&"host".to_string(), InputFrame::default()),
            Err(SyncError::NotHost)
        ));
    }

    #[tokio::test]
    async fn test_header_cannot_disguise_snapshot_as_input() {
        let (mut host, mut joiner, _) = session().await;
        let now = Instant::now();

        let payload = GameStatePayload {
            tick_seq: 99,
            full_sync: true,
            players: vec![],
            enemies: vec![EnemyState {
                enemy_id: "forged".to_string(),
                position: encode_vector(Vec3::ZERO).unwrap(),
                yaw: encode_rotation(0.0).unwrap(),
                health: 10.0,
                removed: false,
            }],
            removed_ids: vec![],
        };
        let disguised = Message {
            header: MessageHeader::new(MessageType::Input),
            payload: MessagePayload::GameState(payload),
        };
        joiner.connection.send_to_host(&disguised, now).unwrap();
        host.poll_network(now);

        assert_eq!(host.get_stats().snapshots_applied, 0);
        assert_eq!(host.remote().enemy_count(), 0);
        assert_eq!(host.connected_peers(), vec!["joiner".to_string()]);
    }

    #[tokio::test]
    async fn test_silent_peer_excluded_from_next_broadcast() {
        let (mut host, _joiner, _) = session().await;
        let start = Instant::now();
        host.simulation_mut().place_player(&"joiner".to_string(), Vec3::ZERO);

        let before = host.host_tick(start).unwrap();
        assert!(before.player("joiner").is_some());

        // The joiner never answers; pings go unanswered until the timeout.
        host.poll_network(start + Duration::from_secs(11));
        assert!(host.connected_peers().is_empty());
        assert!(host
            .take_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerDisconnected { reason: DisconnectReason::Timeout, .. })));

        // Timer released with the last peer, so nothing more goes out.
        assert!(host.host_tick(start + Duration::from_secs(11)).is_none());
    }

    #[tokio::test]
    async fn test_departed_avatar_filtered_from_players() {
        let (mut host, _joiner, _) = session().await;
        host.simulation_mut().place_player(&"ghost".to_string(), Vec3::ZERO);

        let snapshot = host.host_tick(Instant::now()).unwrap();
        assert!(snapshot.player("ghost").is_none());
        assert!(snapshot.player("host").is_some());
    }

    #[tokio::test]
    async fn test_stale_snapshot_discarded() {
        let (_host, mut joiner, _) = session().await;
        let now = Instant::now();
        let payload = |tick: u32| GameStatePayload {
            tick_seq: tick,
            full_sync: false,
            players: vec![],
            enemies: vec![],
            removed_ids: vec![],
        };

        joiner.apply_snapshot(&payload(5), now).unwrap();
        joiner.apply_snapshot(&payload(5), now).unwrap();
        joiner.apply_snapshot(&payload(3), now).unwrap();

        let stats = joiner.get_stats();
        assert_eq!(stats.snapshots_applied, 1);
        assert_eq!(stats.snapshots_discarded, 2);
    }

    #[tokio::test]
    async fn test_snapshots_keep_flowing_across_tick_wrap() {
        let (_host, mut joiner, _) = session().await;
        let now = Instant::now();
        let payload = |tick: u32| GameStatePayload {
            tick_seq: tick,
            full_sync: false,
            players: vec![],
            enemies: vec![],
            removed_ids: vec![],
        };

        joiner.apply_snapshot(&payload(u32::MAX), now).unwrap();
        joiner.apply_snapshot(&payload(0), now).unwrap();
        joiner.apply_snapshot(&payload(1), now).unwrap();
        joiner.apply_snapshot(&payload(u32::MAX), now).unwrap();

        let stats = joiner.get_stats();
        assert_eq!(stats.snapshots_applied, 3);
        assert_eq!(stats.snapshots_discarded, 1);
    }

    #[tokio::test]
    async fn test_host_leave_clears_joined_room() {
        let (mut host, mut joiner, joiner_store) = session().await;
        assert!(joiner_store.snapshot().unwrap().joined_room_id.is_some());

        host.leave_game(Instant::now());
        joiner.poll_network(Instant::now());

        assert_eq!(joiner.state(), SessionState::Disconnected);
        assert!(joiner.take_events().contains(&SessionEvent::HostLeft));
        assert_eq!(joiner_store.snapshot().unwrap().joined_room_id, None);
        assert_eq!(host.identity().hosted_room_id, None);
        assert_eq!(host.state(), SessionState::Left);
    }

    #[tokio::test]
    async fn test_host_lost_keeps_joined_room() {
        let (mut host, mut joiner, joiner_store) = session().await;

        host.dispose();
        joiner.poll_network(Instant::now());

        assert_eq!(joiner.state(), SessionState::Disconnected);
        assert!(joiner.take_events().contains(&SessionEvent::HostLost));
        assert!(joiner_store.snapshot().unwrap().joined_room_id.is_some());
        assert!(host.identity().hosted_room_id.is_some());
    }

    #[tokio::test]
    async fn test_kicked_joiner_forgets_room() {
        let (mut host, mut joiner, joiner_store) = session().await;
        let now = Instant::now();

        host.kick_player(&"joiner".to_string(), "full", now).unwrap();
        assert_eq!(host.next_broadcast_due(), None);

        joiner.poll_network(now);
        assert!(joiner.take_events().contains(&SessionEvent::Kicked {
            reason: "full".to_string()
        }));
        assert_eq!(joiner_store.snapshot().unwrap().joined_room_id, None);
    }

    #[tokio::test]
    async fn test_resume_rehosts_and_rejoins() {
        let (mut host, mut joiner, _) = session().await;
        let room = host.room_id().cloned().unwrap();

        host.dispose();
        joiner.poll_network(Instant::now());
        assert_eq!(joiner.state(), SessionState::Disconnected);

        assert_eq!(
            host.resume().await.unwrap(),
            ResumeOutcome::Hosting {
                room_id: room.clone()
            }
        );

        let accept = async {
            for _ in 0..1000 {
                host.poll_network(Instant::now());
                if !host.connected_peers().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let (outcome, _) = tokio::join!(joiner.resume(), accept);

        assert_eq!(
            outcome.unwrap(),
            ResumeOutcome::Joined {
                room_id: room,
                host_peer_id: "host".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_resume_with_nothing_persisted() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let mut idle = manager(&signaling, identity("idle"));
        assert_eq!(idle.resume().await.unwrap(), ResumeOutcome::NothingToResume);
    }

    #[tokio::test]
    async fn test_resume_unreachable_host() {
        let signaling = MemorySignaling::new(BinaryFormat::MessagePack);
        let store = MemoryIdentityStore::with_identity(PersistedIdentity {
            local_peer_id: "j".to_string(),
            hosted_room_id: None,
            joined_room_id: Some("GONE00".to_string()),
        });
        let mut joiner = manager(&signaling, store);

        assert!(matches!(
            joiner.resume().await.unwrap(),
            ResumeOutcome::HostUnavailable { .. }
        ));
        assert_eq!(joiner.identity().joined_room_id.as_deref(), Some("GONE00"));
    }
}
