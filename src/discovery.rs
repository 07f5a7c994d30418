use crate::error::{Result, SyncError};
use crate::identity::is_valid_room_id;
use crate::protocol::RoomId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type DiscoveryCallback = Arc<dyn Fn(RoomId) + Send + Sync>;

pub trait DiscoveryAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes `room_id` discoverable until the next call or until the
    /// adapter is dropped.
    fn advertise(&self, room_id: &RoomId) -> Result<()>;

    /// Invokes `callback` with every room id found until the returned
    /// handle is stopped.
    fn listen(&self, callback: DiscoveryCallback) -> Result<ListenHandle>;
}

#[derive(Debug, Clone)]
pub struct ListenHandle {
    active: Arc<AtomicBool>,
}

impl ListenHandle {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for ListenHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct ManualState {
    advertised: Option<RoomId>,
    listeners: Vec<(ListenHandle, DiscoveryCallback)>,
}

/// The user reads the code off one screen and types it into the other.
#[derive(Clone, Default)]
pub struct ManualEntryAdapter {
    state: Arc<Mutex<ManualState>>,
}

impl ManualEntryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The code to show the user, if hosting.
    pub fn advertised(&self) -> Option<RoomId> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advertised
            .clone()
    }

    /// Accepts a typed code. Case, spaces and dashes are ignored.
    pub fn submit(&self, input: &str) -> Result<RoomId> {
        let room_id = normalize_room_code(input)?;

        let listeners: Vec<DiscoveryCallback> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.retain(|(handle, _)| handle.is_active());
            state
                .listeners
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };

        tracing::debug!(room = %room_id, listeners = listeners.len(), "manual room code entered");
        for callback in listeners {
            callback(room_id.clone());
        }

        Ok(room_id)
    }
}

impl DiscoveryAdapter for ManualEntryAdapter {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn advertise(&self, room_id: &RoomId) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advertised = Some(room_id.clone());
        Ok(())
    }

    fn listen(&self, callback: DiscoveryCallback) -> Result<ListenHandle> {
        let handle = ListenHandle::new();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .push((handle.clone(), callback));
        Ok(handle)
    }
}

pub fn normalize_room_code(input: &str) -> Result<RoomId> {
    let code: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if !is_valid_room_id(&code) {
        return Err(SyncError::InvalidInput(format!("'{}' is not a room code", input)));
    }
    Ok(code)
}
