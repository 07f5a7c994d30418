use crate::debug;
use crate::error::Result;
use crate::protocol::{GameStatePayload, Message};
use bytes::Bytes;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryFormat {
    Json,
    #[default]
    MessagePack,
    Bincode,
}

impl BinaryFormat {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryFormat::Json => "JSON",
            BinaryFormat::MessagePack => "MessagePack",
            BinaryFormat::Bincode => "Bincode",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BinarySerializer {
    format: BinaryFormat,
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn serialize_message(&self, message: &Message) -> Result<Bytes> {
        let started = Instant::now();

        let data = match self.format {
            BinaryFormat::Json => serde_json::to_vec(message)?,
            BinaryFormat::MessagePack => rmp_serde::to_vec(message)?,
            BinaryFormat::Bincode => bincode::serialize(message)?,
        };

        debug::trace_serialization(self.format.name(), data.len(), started.elapsed().as_micros());
        Ok(Bytes::from(data))
    }

    pub fn deserialize_message(&self, data: &[u8]) -> Result<Message> {
        let started = Instant::now();

        let message = match self.format {
            BinaryFormat::Json => serde_json::from_slice(data)?,
            BinaryFormat::MessagePack => rmp_serde::from_slice(data)?,
            BinaryFormat::Bincode => bincode::deserialize(data)?,
        };

        debug::trace_deserialization(self.format.name(), data.len(), started.elapsed().as_micros());
        Ok(message)
    }

    pub fn serialize_snapshot(&self, snapshot: &GameStatePayload) -> Result<Bytes> {
        let data = match self.format {
            BinaryFormat::Json => serde_json::to_vec(snapshot)?,
            BinaryFormat::MessagePack => rmp_serde::to_vec(snapshot)?,
            BinaryFormat::Bincode => bincode::serialize(snapshot)?,
        };
        Ok(Bytes::from(data))
    }

    pub fn get_format(&self) -> BinaryFormat {
        self.format
    }
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new(BinaryFormat::default())
    }
}
