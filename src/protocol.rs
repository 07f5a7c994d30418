use crate::codec::{CompactRotation, CompactVector};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type PeerId = String;
pub type RoomId = String;
pub type EnemyId = String;

pub const PROTOCOL_VERSION: u32 = 1;

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    GameState = 0,
    Input = 1,
    InitialPosition = 2,
    EnemyKilled = 3,
    StartGame = 4,
    HostLeft = 5,
    Hello = 6,
    Welcome = 7,
    Kicked = 8,
    Ping = 9,
    Pong = 10,
}

impl MessageType {
    /// Messages only the host may originate.
    pub fn is_host_originated(&self) -> bool {
        matches!(
            self,
            MessageType::GameState
                | MessageType::StartGame
                | MessageType::HostLeft
                | MessageType::Welcome
                | MessageType::Kicked
        )
    }

    /// Messages only a joiner may originate.
    pub fn is_joiner_originated(&self) -> bool {
        matches!(
            self,
            MessageType::Input
                | MessageType::InitialPosition
                | MessageType::EnemyKilled
                | MessageType::Hello
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub timestamp: u64,
    pub sequence: u64,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let sequence = SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            msg_type,
            timestamp,
            sequence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MessagePayload {
    GameState(GameStatePayload),
    Input(InputFrame),
    InitialPosition { position: CompactVector },
    EnemyKilled { enemy_id: EnemyId },
    StartGame,
    HostLeft,
    Hello { peer_id: PeerId, protocol_version: u32 },
    Welcome { host_peer_id: PeerId },
    Kicked { reason: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::GameState(_) => MessageType::GameState,
            MessagePayload::Input(_) => MessageType::Input,
            MessagePayload::InitialPosition { .. } => MessageType::InitialPosition,
            MessagePayload::EnemyKilled { .. } => MessageType::EnemyKilled,
            MessagePayload::StartGame => MessageType::StartGame,
            MessagePayload::HostLeft => MessageType::HostLeft,
            MessagePayload::Hello { .. } => MessageType::Hello,
            MessagePayload::Welcome { .. } => MessageType::Welcome,
            MessagePayload::Kicked { .. } => MessageType::Kicked,
            MessagePayload::Ping { .. } => MessageType::Ping,
            MessagePayload::Pong { .. } => MessageType::Pong,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatePayload {
    pub tick_seq: u32,
    pub full_sync: bool,
    pub players: Vec<PlayerState>,
    pub enemies: Vec<EnemyState>,
    pub removed_ids: Vec<EnemyId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub peer_id: PeerId,
    pub position: CompactVector,
    pub yaw: CompactRotation,
    pub animation: AnimationTag,
    pub model_id: u16,
    pub color_id: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnemyState {
    pub enemy_id: EnemyId,
    pub position: CompactVector,
    pub yaw: CompactRotation,
    pub health: f32,
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnimationTag {
    #[default]
    Idle = 0,
    Walk = 1,
    Run = 2,
    Jump = 3,
    Fall = 4,
    Attack = 5,
    Hurt = 6,
    Dead = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFrame {
    pub move_x: f32,
    pub move_z: f32,
    pub jump_pressed: bool,
}

impl InputFrame {
    pub fn new(move_x: f32, move_z: f32, jump_pressed: bool) -> Self {
        Self {
            move_x,
            move_z,
            jump_pressed,
        }
    }

    /// Rejects non-finite axes and clamps the rest into [-1, 1].
    pub fn validated(self) -> Result<Self> {
        if !self.move_x.is_finite() || !self.move_z.is_finite() {
            return Err(SyncError::InvalidInput(format!(
                "non-finite movement axes ({}, {})",
                self.move_x, self.move_z
            )));
        }

        Ok(Self {
            move_x: self.move_x.clamp(-1.0, 1.0),
            move_z: self.move_z.clamp(-1.0, 1.0),
            jump_pressed: self.jump_pressed,
        })
    }
}

impl Message {
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            header: MessageHeader::new(payload.message_type()),
            payload,
        }
    }

    pub fn game_state(payload: GameStatePayload) -> Self {
        Self::new(MessagePayload::GameState(payload))
    }

    pub fn input(frame: InputFrame) -> Self {
        Self::new(MessagePayload::Input(frame))
    }

    pub fn initial_position(position: CompactVector) -> Self {
        Self::new(MessagePayload::InitialPosition { position })
    }

    pub fn enemy_killed(enemy_id: EnemyId) -> Self {
        Self::new(MessagePayload::EnemyKilled { enemy_id })
    }

    pub fn start_game() -> Self {
        Self::new(MessagePayload::StartGame)
    }

    pub fn host_left() -> Self {
        Self::new(MessagePayload::HostLeft)
    }

    pub fn hello(peer_id: PeerId) -> Self {
        Self::new(MessagePayload::Hello {
            peer_id,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn welcome(host_peer_id: PeerId) -> Self {
        Self::new(MessagePayload::Welcome { host_peer_id })
    }

    pub fn kicked(reason: String) -> Self {
        Self::new(MessagePayload::Kicked { reason })
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(MessagePayload::Ping { nonce })
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(MessagePayload::Pong { nonce })
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// Header type is sender-supplied; it must agree with the payload.
    pub fn is_consistent(&self) -> bool {
        self.header.msg_type == self.payload.message_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_type_follows_payload() {
        let message = Message::enemy_killed("e7".to_string());
        assert_eq!(message.msg_type(), MessageType::EnemyKilled);
        assert_eq!(message.payload.message_type(), MessageType::EnemyKilled);
        assert!(message.is_consistent());
    }

    #[test]
    fn test_mismatched_header_is_inconsistent() {
        let message = Message {
            header: MessageHeader::new(MessageType::Input),
            payload: MessagePayload::StartGame,
        };
        assert!(!message.is_consistent());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let first = Message::ping(1);
        let second = Message::ping(2);
        assert!(second.header.sequence > first.header.sequence);
    }

    #[test]
    fn test_wire_discriminants_are_camel_case() {
        let json = serde_json::to_value(&MessagePayload::EnemyKilled {
            enemy_id: "e7".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"enemyKilled": {"enemyId": "e7"}}));

        let json = serde_json::to_value(&MessagePayload::Input(InputFrame::new(0.5, -1.0, true))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"input": {"moveX": 0.5, "moveZ": -1.0, "jumpPressed": true}})
        );

        let json = serde_json::to_value(&MessagePayload::StartGame).unwrap();
        assert_eq!(json, serde_json::json!("startGame"));
    }

    #[test]
    fn test_direction_classification() {
        assert!(MessageType::GameState.is_host_originated());
        assert!(MessageType::HostLeft.is_host_originated());
        assert!(!MessageType::Input.is_host_originated());
        assert!(MessageType::EnemyKilled.is_joiner_originated());
        assert!(!MessageType::Ping.is_joiner_originated());
        assert!(!MessageType::Ping.is_host_originated());
    }

    #[test]
    fn test_input_validation_clamps() {
        let frame = InputFrame::new(2.5, -3.0, true).validated().unwrap();
        assert_eq!(frame.move_x, 1.0);
        assert_eq!(frame.move_z, -1.0);
        assert!(frame.jump_pressed);
    }

    #[test]
    fn test_input_validation_rejects_nan() {
        assert!(matches!(
            InputFrame::new(f32::NAN, 0.0, false).validated(),
            Err(SyncError::InvalidInput(_))
        ));
        assert!(InputFrame::new(0.0, f32::NEG_INFINITY, false).validated().is_err());
    }
}
