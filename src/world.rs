use crate::protocol::{AnimationTag, EnemyId, PeerId};
use crate::snapshot::{EnemySnapshot, PlayerSnapshot};
use crate::sync::HostSimulation;
use ahash::AHashMap;
use glam::Vec3;

pub struct SimpleWorld {
    players: AHashMap<PeerId, PlayerSnapshot>,
    enemies: AHashMap<EnemyId, EnemySnapshot>,
    spawn_point: Vec3,
    move_step: f32,
}

impl Default for SimpleWorld {
    fn default() -> Self {
        Self {
            players: AHashMap::new(),
            enemies: AHashMap::new(),
            spawn_point: Vec3::ZERO,
            move_step: 0.1,
        }
    }
}

impl SimpleWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spawn_point(mut self, spawn_point: Vec3) -> Self {
        self.spawn_point = spawn_point;
        self
    }

    /// Distance covered by one full-deflection input frame.
    pub fn with_move_step(mut self, step: f32) -> Self {
        self.move_step = step;
        self
    }

    pub fn spawn_enemy(&mut self, enemy_id: EnemyId, position: Vec3, health: f32) {
        self.enemies
            .insert(enemy_id.clone(), EnemySnapshot::new(enemy_id, position, 0.0, health));
    }

    pub fn player(&self, peer_id: &str) -> Option<&PlayerSnapshot> {
        self.players.get(peer_id)
    }

    pub fn enemy(&self, enemy_id: &str) -> Option<&EnemySnapshot> {
        self.enemies.get(enemy_id)
    }
}

impl HostSimulation for SimpleWorld {
    fn on_peer_joined(&mut self, peer_id: &PeerId) {
        let spawn_point = self.spawn_point;
        self.players
            .entry(peer_id.clone())
            .or_insert_with(|| PlayerSnapshot::new(peer_id.clone(), spawn_point, 0.0));
    }

    fn on_peer_left(&mut self, peer_id: &PeerId) {
        self.players.remove(peer_id);
    }

    fn place_player(&mut self, peer_id: &PeerId, position: Vec3) {
        self.players
            .entry(peer_id.clone())
            .and_modify(|player| player.position = position)
            .or_insert_with(|| PlayerSnapshot::new(peer_id.clone(), position, 0.0));
    }

    fn apply_movement(&mut self, peer_id: &PeerId, move_x: f32, move_z: f32) {
        let Some(player) = self.players.get_mut(peer_id) else {
            return;
        };

        let direction = Vec3::new(move_x, 0.0, move_z);
        if direction.length_squared() == 0.0 {
            player.animation = AnimationTag::Idle;
            return;
        }

        player.position += direction * self.move_step;
        player.yaw = move_x.atan2(move_z);
        player.animation = AnimationTag::Walk;
    }

    fn request_jump(&mut self, peer_id: &PeerId) {
        if let Some(player) = self.players.get_mut(peer_id) {
            player.animation = AnimationTag::Jump;
        }
    }

    fn kill_enemy(&mut self, enemy_id: &EnemyId) -> bool {
        self.enemies.remove(enemy_id).is_some()
    }

    fn players(&self) -> Vec<PlayerSnapshot> {
        self.players.values().cloned().collect()
    }

    fn enemies(&self) -> Vec<EnemySnapshot> {
        let mut enemies: Vec<EnemySnapshot> = self.enemies.values().cloned().collect();
        enemies.sort_by(|a, b| a.enemy_id.cmp(&b.enemy_id));
        enemies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_and_jump() {
        let mut world = SimpleWorld::new().with_move_step(1.0);
        let id = "p".to_string();
        world.on_peer_joined(&id);

        world.apply_movement(&id, 1.0, 0.0);
        let player = world.player("p").unwrap();
        assert_eq!(player.position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(player.animation, AnimationTag::Walk);

        world.request_jump(&id);
        assert_eq!(world.player("p").unwrap().animation, AnimationTag::Jump);
    }

    #[test]
    fn test_kill_only_known_enemies() {
        let mut world = SimpleWorld::new();
        world.spawn_enemy("e1".to_string(), Vec3::ZERO, 3.0);

        assert!(!world.kill_enemy(&"e7".to_string()));
        assert!(world.kill_enemy(&"e1".to_string()));
        assert!(world.enemies().is_empty());
    }

    #[test]
    fn test_join_keeps_existing_avatar() {
        let mut world = SimpleWorld::new();
        let id = "p".to_string();
        world.place_player(&id, Vec3::ONE);
        world.on_peer_joined(&id);
        assert_eq!(world.player("p").unwrap().position, Vec3::ONE);

        world.on_peer_left(&id);
        assert!(world.player("p").is_none());
    }
}
