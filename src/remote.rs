use crate::error::{Result, SyncError};
use crate::protocol::{AnimationTag, EnemyId, PeerId};
use crate::snapshot::{EnemySnapshot, PlayerSnapshot};
use ahash::{AHashMap, AHashSet};
use glam::Vec3;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntity {
    pub peer_id: PeerId,
    pub position: Vec3,
    pub target_position: Vec3,
    pub yaw: f32,
    pub animation: AnimationTag,
    pub model_id: u16,
    pub color_id: u16,
    pub last_update: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEnemy {
    pub enemy_id: EnemyId,
    pub position: Vec3,
    pub yaw: f32,
    pub health: f32,
    /// Set while the enemy exists only because this client spawned it.
    pub spawned_locally_at: Option<Instant>,
    pub last_update: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnemyChanges {
    pub spawned: Vec<EnemyId>,
    pub removed: Vec<EnemyId>,
}

impl EnemyChanges {
    pub fn is_empty(&self) -> bool {
        self.spawned.is_empty() && self.removed.is_empty()
    }
}

pub struct RemotePlayerManager {
    players: AHashMap<PeerId, RemoteEntity>,
    enemies: AHashMap<EnemyId, RemoteEnemy>,
    spawn_grace: Duration,
}

impl RemotePlayerManager {
    pub fn new(spawn_grace: Duration) -> Self {
        Self {
            players: AHashMap::new(),
            enemies: AHashMap::new(),
            spawn_grace,
        }
    }

    pub fn update_player(&mut self, snapshot: &PlayerSnapshot, now: Instant) -> Result<()> {
        if !snapshot.position.is_finite() || !snapshot.yaw.is_finite() {
            return Err(SyncError::MalformedSnapshot(format!(
                "non-finite pose for player {}",
                snapshot.peer_id
            )));
        }

        match self.players.get_mut(&snapshot.peer_id) {
            Some(entity) => {
                entity.target_position = snapshot.position;
                entity.yaw = snapshot.yaw;
                entity.animation = snapshot.animation;
                entity.model_id = snapshot.model_id;
                entity.color_id = snapshot.color_id;
                entity.last_update = now;
            }
            None => {
                tracing::debug!(peer = %snapshot.peer_id, "remote player appeared");
                self.players.insert(
                    snapshot.peer_id.clone(),
                    RemoteEntity {
                        peer_id: snapshot.peer_id.clone(),
                        position: snapshot.position,
                        target_position: snapshot.position,
                        yaw: snapshot.yaw,
                        animation: snapshot.animation,
                        model_id: snapshot.model_id,
                        color_id: snapshot.color_id,
                        last_update: now,
                    },
                );
            }
        }

        Ok(())
    }

    /// Moves every rendered position toward its target by `blend`
    /// (`1.0` places it directly).
    pub fn advance(&mut self, blend: f32) {
        let blend = blend.clamp(0.0, 1.0);
        for entity in self.players.values_mut() {
            entity.position = entity.position.lerp(entity.target_position, blend);
        }
    }

    pub fn retain_players(&mut self, ids: &[PeerId]) -> Vec<PeerId> {
        let mut dropped: Vec<PeerId> = self
            .players
            .keys()
            .filter(|id| !ids.contains(id))
            .cloned()
            .collect();
        dropped.sort();

        for id in &dropped {
            self.players.remove(id);
        }
        dropped
    }

    pub fn remove_player(&mut self, peer_id: &str) -> Option<RemoteEntity> {
        self.players.remove(peer_id)
    }

    pub fn remove_all_players(&mut self) {
        self.players.clear();
    }

    pub fn update_enemies_from_host(
        &mut self,
        enemies: &[EnemySnapshot],
        removed_ids: &[EnemyId],
        full_sync: bool,
        now: Instant,
    ) -> EnemyChanges {
        let mut changes = EnemyChanges::default();
        let mut listed = AHashSet::with_capacity(enemies.len());

        for enemy in enemies {
            if enemy.removed {
                if self.enemies.remove(&enemy.enemy_id).is_some() {
                    changes.removed.push(enemy.enemy_id.clone());
                }
                continue;
            }

            if !enemy.position.is_finite() || !enemy.yaw.is_finite() {
                tracing::warn!(enemy = %enemy.enemy_id, "ignoring enemy with non-finite pose");
                continue;
            }

            listed.insert(enemy.enemy_id.clone());
            let replica = RemoteEnemy {
                enemy_id: enemy.enemy_id.clone(),
                position: enemy.position,
                yaw: enemy.yaw,
                health: enemy.health,
                spawned_locally_at: None,
                last_update: now,
            };

            if self.enemies.insert(enemy.enemy_id.clone(), replica).is_none() {
                changes.spawned.push(enemy.enemy_id.clone());
            }
        }

        for id in removed_ids {
            if self.enemies.remove(id).is_some() {
                changes.removed.push(id.clone());
            }
        }

        if full_sync {
            let grace = self.spawn_grace;
            let stale: Vec<EnemyId> = self
                .enemies
                .values()
                .filter(|enemy| !listed.contains(&enemy.enemy_id))
                .filter(|enemy| match enemy.spawned_locally_at {
                    Some(at) => now.saturating_duration_since(at) > grace,
                    None => true,
                })
                .map(|enemy| enemy.enemy_id.clone())
                .collect();

            for id in stale {
                self.enemies.remove(&id);
                changes.removed.push(id);
            }
        }

        changes.spawned.sort();
        changes.removed.sort();
        changes
    }

    /// Shows an enemy before the host has confirmed it. A full sync will not
    /// remove it until the spawn grace has passed.
    pub fn spawn_local_enemy(&mut self, enemy_id: EnemyId, position: Vec3, now: Instant) -> Result<()> {
        if !position.is_finite() {
            return Err(SyncError::InvalidInput(format!(
                "non-finite spawn position for enemy {}",
                enemy_id
            )));
        }

        self.enemies.entry(enemy_id.clone()).or_insert(RemoteEnemy {
            enemy_id,
            position,
            yaw: 0.0,
            health: 0.0,
            spawned_locally_at: Some(now),
            last_update: now,
        });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.players.clear();
        self.enemies.clear();
    }

    pub fn player(&self, peer_id: &str) -> Option<&RemoteEntity> {
        self.players.get(peer_id)
    }

    pub fn players(&self) -> impl Iterator<Item = &RemoteEntity> {
        self.players.values()
    }

    pub fn enemy(&self, enemy_id: &str) -> Option<&RemoteEnemy> {
        self.enemies.get(enemy_id)
    }

    pub fn enemies(&self) -> impl Iterator<Item = &RemoteEnemy> {
        self.enemies.values()
    }

    pub fn enemy_ids(&self) -> Vec<EnemyId> {
        let mut ids: Vec<EnemyId> = self.enemies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn enemy_count(&self) -> usize {
        self.enemies.len()
    }
}
