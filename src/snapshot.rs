use crate::codec::{decode_rotation, decode_vector, encode_rotation, encode_vector};
use crate::error::{Result, SyncError};
use crate::protocol::{AnimationTag, EnemyId, EnemyState, GameStatePayload, PeerId, PlayerState};
use ahash::{AHashMap, AHashSet};
use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AvatarPose {
    pub position: Vec3,
    pub yaw: f32,
}

impl AvatarPose {
    pub fn new(position: Vec3, yaw: f32) -> Self {
        Self { position, yaw }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub peer_id: PeerId,
    pub position: Vec3,
    pub yaw: f32,
    pub animation: AnimationTag,
    pub model_id: u16,
    pub color_id: u16,
}

impl PlayerSnapshot {
    pub fn new(peer_id: PeerId, position: Vec3, yaw: f32) -> Self {
        Self {
            peer_id,
            position,
            yaw,
            animation: AnimationTag::Idle,
            model_id: 0,
            color_id: 0,
        }
    }

    pub fn with_animation(mut self, animation: AnimationTag) -> Self {
        self.animation = animation;
        self
    }

    pub fn with_appearance(mut self, model_id: u16, color_id: u16) -> Self {
        self.model_id = model_id;
        self.color_id = color_id;
        self
    }

    pub fn to_wire(&self) -> Result<PlayerState> {
        Ok(PlayerState {
            peer_id: self.peer_id.clone(),
            position: encode_vector(self.position)?,
            yaw: encode_rotation(self.yaw)?,
            animation: self.animation,
            model_id: self.model_id,
            color_id: self.color_id,
        })
    }

    pub fn from_wire(state: &PlayerState) -> Self {
        Self {
            peer_id: state.peer_id.clone(),
            position: decode_vector(state.position),
            yaw: decode_rotation(state.yaw),
            animation: state.animation,
            model_id: state.model_id,
            color_id: state.color_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnemySnapshot {
    pub enemy_id: EnemyId,
    pub position: Vec3,
    pub yaw: f32,
    pub health: f32,
    pub removed: bool,
}

impl EnemySnapshot {
    pub fn new(enemy_id: EnemyId, position: Vec3, yaw: f32, health: f32) -> Self {
        Self {
            enemy_id,
            position,
            yaw,
            health,
            removed: false,
        }
    }

    pub fn to_wire(&self) -> Result<EnemyState> {
        if !self.health.is_finite() {
            return Err(SyncError::InvalidInput(format!(
                "enemy {} has non-finite health",
                self.enemy_id
            )));
        }

        Ok(EnemyState {
            enemy_id: self.enemy_id.clone(),
            position: encode_vector(self.position)?,
            yaw: encode_rotation(self.yaw)?,
            health: self.health,
            removed: self.removed,
        })
    }

    pub fn from_wire(state: &EnemyState) -> Result<Self> {
        if !state.health.is_finite() {
            return Err(SyncError::MalformedSnapshot(format!(
                "enemy {} has non-finite health",
                state.enemy_id
            )));
        }

        Ok(Self {
            enemy_id: state.enemy_id.clone(),
            position: decode_vector(state.position),
            yaw: decode_rotation(state.yaw),
            health: state.health,
            removed: state.removed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameStateSnapshot {
    pub tick_seq: u32,
    pub full_sync: bool,
    pub players: AHashMap<PeerId, PlayerSnapshot>,
    pub enemies: Vec<EnemySnapshot>,
    pub removed_enemy_ids: Vec<EnemyId>,
}

impl GameStateSnapshot {
    pub fn player(&self, peer_id: &str) -> Option<&PlayerSnapshot> {
        self.players.get(peer_id)
    }

    /// Encodes for the wire. An entity that cannot be encoded is left out of
    /// this tick rather than failing the whole broadcast.
    pub fn to_payload(&self) -> GameStatePayload {
        let mut player_ids: Vec<&PeerId> = self.players.keys().collect();
        player_ids.sort();

        let players = player_ids
            .into_iter()
            .filter_map(|id| {
                let player = &self.players[id];
                player
                    .to_wire()
                    .map_err(|e| tracing::warn!(peer = %id, error = %e, "skipping unencodable player"))
                    .ok()
            })
            .collect();

        let enemies = self
            .enemies
            .iter()
            .filter_map(|enemy| {
                enemy
                    .to_wire()
                    .map_err(|e| tracing::warn!(enemy = %enemy.enemy_id, error = %e, "skipping unencodable enemy"))
                    .ok()
            })
            .collect();

        GameStatePayload {
            tick_seq: self.tick_seq,
            full_sync: self.full_sync,
            players,
            enemies,
            removed_ids: self.removed_enemy_ids.clone(),
        }
    }

    /// Decodes a received snapshot. Either every entry decodes or the whole
    /// snapshot is rejected.
    pub fn from_payload(payload: &GameStatePayload) -> Result<Self> {
        let mut players = AHashMap::with_capacity(payload.players.len());
        for state in &payload.players {
            let player = PlayerSnapshot::from_wire(state);
            if players.insert(player.peer_id.clone(), player).is_some() {
                return Err(SyncError::MalformedSnapshot(format!(
                    "player {} listed twice",
                    state.peer_id
                )));
            }
        }

        let enemies = payload
            .enemies
            .iter()
            .map(EnemySnapshot::from_wire)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tick_seq: payload.tick_seq,
            full_sync: payload.full_sync,
            players,
            enemies,
            removed_enemy_ids: payload.removed_ids.clone(),
        })
    }
}

/// Host-side snapshot assembly: tick numbering, full-sync cadence and
/// enemy-removal diffing against the previous broadcast.
pub struct SnapshotBuilder {
    tick_seq: u32,
    full_sync_every: u32,
    force_full_sync: bool,
    known_enemies: AHashSet<EnemyId>,
}

impl SnapshotBuilder {
    pub fn new(full_sync_every: u32) -> Self {
        Self {
            tick_seq: 0,
            full_sync_every: full_sync_every.max(1),
            force_full_sync: false,
            known_enemies: AHashSet::new(),
        }
    }

    pub fn request_full_sync(&mut self) {
        self.force_full_sync = true;
    }

    /// Builds the next snapshot. `players` is filtered down to the host's own
    /// avatar plus `connected` peers.
    pub fn build(
        &mut self,
        local_peer_id: &PeerId,
        connected: &[PeerId],
        players: impl IntoIterator<Item = PlayerSnapshot>,
        enemies: impl IntoIterator<Item = EnemySnapshot>,
    ) -> GameStateSnapshot {
        self.tick_seq = self.tick_seq.wrapping_add(1);
        let full_sync = self.force_full_sync || self.tick_seq % self.full_sync_every == 0;
        self.force_full_sync = false;

        let players: AHashMap<PeerId, PlayerSnapshot> = players
            .into_iter()
            .filter(|p| &p.peer_id == local_peer_id || connected.contains(&p.peer_id))
            .map(|p| (p.peer_id.clone(), p))
            .collect();

        let enemies: Vec<EnemySnapshot> = enemies.into_iter().collect();
        let alive: AHashSet<EnemyId> = enemies
            .iter()
            .filter(|e| !e.removed)
            .map(|e| e.enemy_id.clone())
            .collect();

        let mut removed_enemy_ids: Vec<EnemyId> = self
            .known_enemies
            .iter()
            .filter(|id| !alive.contains(*id))
            .filter(|id| !enemies.iter().any(|e| e.removed && &e.enemy_id == *id))
            .cloned()
            .collect();
        removed_enemy_ids.sort();

        self.known_enemies = alive;

        GameStateSnapshot {
            tick_seq: self.tick_seq,
            full_sync,
            players,
            enemies,
            removed_enemy_ids,
        }
    }

    pub fn tick_seq(&self) -> u32 {
        self.tick_seq
    }

    pub fn reset(&mut self) {
        self.tick_seq = 0;
        self.force_full_sync = false;
        self.known_enemies.clear();
    }
}

/// Serial-number ordering for the wrapping `tick_seq`: `tick` is newer when
/// it lies less than half the counter range ahead of `last`.
pub fn is_newer_tick(tick: u32, last: u32) -> bool {
    (tick.wrapping_sub(last) as i32) > 0
}
