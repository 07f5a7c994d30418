use crate::error::Result;
use crate::protocol::{PeerId, RoomId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const ROOM_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_ID_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub local_peer_id: PeerId,
    #[serde(default)]
    pub hosted_room_id: Option<RoomId>,
    #[serde(default)]
    pub joined_room_id: Option<RoomId>,
}

impl PersistedIdentity {
    pub fn generate() -> Self {
        Self {
            local_peer_id: generate_peer_id(),
            hosted_room_id: None,
            joined_room_id: None,
        }
    }
}

pub fn generate_peer_id() -> PeerId {
    let value: u64 = rand::rng().random();
    format!("{:016x}", value)
}

/// Whether `room_id` looks like a generated room id.
pub fn is_valid_room_id(room_id: &str) -> bool {
    room_id.len() == ROOM_ID_LEN && room_id.bytes().all(|b| ROOM_ALPHABET.contains(&b))
}

pub fn generate_room_id() -> RoomId {
    let mut rng = rand::rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ALPHABET[rng.random_range(0..ROOM_ALPHABET.len())] as char)
        .collect()
}

pub trait IdentityStore: Send {
    /// Returns the stored identity, creating and saving a fresh one on first use.
    fn load(&mut self) -> Result<PersistedIdentity>;

    fn save(&mut self, identity: &PersistedIdentity) -> Result<()>;
}

/// Volatile store. Clones share the same slot, so a test can inspect what a
/// session persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    slot: Arc<Mutex<Option<PersistedIdentity>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: PersistedIdentity) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(identity))),
        }
    }

    pub fn snapshot(&self) -> Option<PersistedIdentity> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&mut self) -> Result<PersistedIdentity> {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(slot.get_or_insert_with(PersistedIdentity::generate).clone())
    }

    fn save(&mut self, identity: &PersistedIdentity) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(identity.clone());
        Ok(())
    }
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&mut self) -> Result<PersistedIdentity> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = PersistedIdentity::generate();
                self.save(&identity)?;
                tracing::info!(peer_id = %identity.local_peer_id, path = %self.path.display(), "generated local identity");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, identity: &PersistedIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(identity)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
