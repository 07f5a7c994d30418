pub mod codec;
pub mod protocol;
pub mod serialization;
pub mod transport;
pub mod identity;
pub mod session;
pub mod connection;
pub mod snapshot;
pub mod reconcile;
pub mod remote;
pub mod sync;
pub mod world;
pub mod runtime;
pub mod discovery;
pub mod error;
pub mod debug;

pub use codec::{
    CompactRotation, CompactVector,
    encode_vector, decode_vector,
    encode_rotation, decode_rotation,
};

pub use protocol::{
    PeerId, RoomId, EnemyId, PROTOCOL_VERSION,
    Message, MessageType, MessageHeader, MessagePayload,
    GameStatePayload, PlayerState, EnemyState, AnimationTag, InputFrame,
};

pub use serialization::{
    BinarySerializer, BinaryFormat,
};

pub use transport::{
    Transport, Signaling, IncomingLinks, MemoryTransport, MemorySignaling,
};

pub use identity::{
    IdentityStore, PersistedIdentity, MemoryIdentityStore, FileIdentityStore,
    generate_peer_id, generate_room_id,
};

pub use session::{
    Role, SessionState, SessionEvent, DisconnectReason,
};

pub use connection::{
    ConnectionManager, ConnectionConfig, JoinOutcome, JoinAttempt, JoinResult,
};

pub use snapshot::{
    AvatarPose, PlayerSnapshot, EnemySnapshot, GameStateSnapshot, SnapshotBuilder,
    is_newer_tick,
};

pub use reconcile::{
    StateReconciler, ReconcileConfig, Correction,
};

pub use remote::{
    RemotePlayerManager, RemoteEntity, RemoteEnemy,
};

pub use sync::{
    SyncManager, SyncConfig, SyncStats, HostSimulation, ResumeOutcome, ResumeTarget,
};

pub use world::SimpleWorld;

pub use runtime::{
    SyncHandle, SyncStatus,
};

pub use discovery::{
    DiscoveryAdapter, DiscoveryCallback, ListenHandle, ManualEntryAdapter,
};

pub use error::{
    SyncError, Result,
};

pub use debug::{
    init_logging, init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_message, trace_snapshot, trace_serialization, trace_deserialization,
    trace_transport_send, trace_transport_receive,
    format_bytes, message_summary,
};
