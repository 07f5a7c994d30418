use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Host unavailable: {0}")]
    HostUnavailable(String),

    #[error("Peer {0} timed out")]
    PeerTimeout(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation requires the host role")]
    NotHost,

    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Sync actor has shut down")]
    ActorGone,
}

impl SyncError {
    /// True for errors caused by a payload that could not be decoded. These
    /// are recovered by discarding the offending message.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedSnapshot(_)
                | SyncError::Json(_)
                | SyncError::MsgPackDecode(_)
                | SyncError::Bincode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
