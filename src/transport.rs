use crate::debug;
use crate::error::{Result, SyncError};
use crate::protocol::{Message, RoomId};
use crate::serialization::{BinaryFormat, BinarySerializer};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One reliable, ordered channel to a single peer.
pub trait Transport: Send {
    fn send(&mut self, message: &Message) -> Result<()>;
    fn receive(&mut self) -> Result<Option<Message>>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Links handed to a host as joiners connect to its room. Dropping the
/// receiver releases the room registration.
pub type IncomingLinks<T> = mpsc::UnboundedReceiver<T>;

/// The identifier registration layer of the underlying peer-connection
/// library: hosts register a room id, joiners open a link to it.
#[async_trait]
pub trait Signaling: Send + Sync {
    type Link: Transport + 'static;

    async fn register(&self, room_id: &RoomId) -> Result<IncomingLinks<Self::Link>>;

    async fn connect(&self, room_id: &RoomId) -> Result<Self::Link>;
}

pub struct MemoryTransport {
    serializer: BinarySerializer,
    label: String,
    outgoing: mpsc::UnboundedSender<Bytes>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    connected: bool,
}

impl MemoryTransport {
    pub fn create_pair(format: BinaryFormat) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Self {
            serializer: BinarySerializer::new(format),
            label: "memory:a".to_string(),
            outgoing: a_tx,
            incoming: b_rx,
            connected: true,
        };
        let b = Self {
            serializer: BinarySerializer::new(format),
            label: "memory:b".to_string(),
            outgoing: b_tx,
            incoming: a_rx,
            connected: true,
        };

        (a, b)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn send_raw(&mut self, data: Bytes) -> Result<()> {
        if !self.connected {
            return Err(SyncError::ConnectionClosed);
        }

        self.outgoing
            .send(data)
            .map_err(|_| SyncError::ConnectionClosed)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &Message) -> Result<()> {
        if !self.connected {
            return Err(SyncError::ConnectionClosed);
        }

        let data = self.serializer.serialize_message(message)?;
        debug::trace_transport_send(data.len(), &self.label);

        self.outgoing
            .send(data)
            .map_err(|_| SyncError::ConnectionClosed)
    }

    fn receive(&mut self) -> Result<Option<Message>> {
        if !self.connected {
            return Err(SyncError::ConnectionClosed);
        }

        match self.incoming.try_recv() {
            Ok(data) => {
                debug::trace_transport_receive(data.len(), &self.label);
                let message = self.serializer.deserialize_message(&data)?;
                Ok(Some(message))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.connected = false;
                Err(SyncError::ConnectionClosed)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.incoming.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.outgoing.is_closed()
    }
}

#[derive(Clone)]
pub struct MemorySignaling {
    rooms: Arc<Mutex<AHashMap<RoomId, mpsc::UnboundedSender<MemoryTransport>>>>,
    format: BinaryFormat,
    online: bool,
}

impl MemorySignaling {
    pub fn new(format: BinaryFormat) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(AHashMap::new())),
            format,
            online: true,
        }
    }

    pub fn offline(format: BinaryFormat) -> Self {
        Self {
            online: false,
            ..Self::new(format)
        }
    }

    pub async fn is_registered(&self, room_id: &RoomId) -> bool {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    type Link = MemoryTransport;

    async fn register(&self, room_id: &RoomId) -> Result<IncomingLinks<MemoryTransport>> {
        if !self.online {
            return Err(SyncError::SignalingUnavailable(
                "signaling server unreachable".to_string(),
            ));
        }

        let mut rooms = self.rooms.lock().await;
        if let Some(existing) = rooms.get(room_id) {
            if !existing.is_closed() {
                return Err(SyncError::SignalingUnavailable(format!(
                    "room {} is already registered",
                    room_id
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        rooms.insert(room_id.clone(), tx);
        Ok(rx)
    }

    async fn connect(&self, room_id: &RoomId) -> Result<MemoryTransport> {
        if !self.online {
            return Err(SyncError::HostUnavailable(
                "signaling server unreachable".to_string(),
            ));
        }

        let mut rooms = self.rooms.lock().await;
        let Some(acceptor) = rooms.get(room_id) else {
            return Err(SyncError::HostUnavailable(format!("unknown room {}", room_id)));
        };

        let (host_end, joiner_end) = MemoryTransport::create_pair(self.format);
        if acceptor.send(host_end.with_label(format!("{}:host", room_id))).is_err() {
            rooms.remove(room_id);
            return Err(SyncError::HostUnavailable(format!("room {} is closed", room_id)));
        }

        Ok(joiner_end.with_label(format!("{}:joiner", room_id)))
    }
}
