//! Payload serializers
//!
//! A serializer turns a [`Message`] payload into bytes and back. Each one has
//! a small numeric id (written into the high nibble of the codec byte) and a
//! unique name (used in configuration).
//!
//! Built-in serializers:
//!
//! | id | name      | format                      |
//! |----|-----------|-----------------------------|
//! | 0  | `json`    | `serde_json`                |
//! | 1  | `msgpack` | MessagePack via `rmp-serde` |

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{CadeError, Result};
use crate::protocol::{Message, MessageType};

/// Codec ids live in a nibble.
pub const MAX_CODEC_ID: u8 = 15;

/// Payload serializer extension point.
pub trait Serializer: Send + Sync {
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    /// Decodes a payload whose shape is given by the frame's message type.
    fn deserialize(&self, kind: MessageType, bytes: &[u8]) -> Result<Message>;
}

/// Dispatches on the message shape with a pair of typed encode/decode functions.
fn encode_with<E>(message: &Message, encode: E) -> Result<Vec<u8>>
where
    E: Fn(&dyn erased::Payload) -> Result<Vec<u8>>,
{
    match message {
        Message::Request(request) => encode(request),
        Message::Response(response) => encode(response),
        Message::HeartbeatRequest(beat) | Message::HeartbeatResponse(beat) => encode(beat),
    }
}

mod erased {
    use super::*;

    /// Object-safe view of the payload types, so one closure can encode all of them.
    pub trait Payload {
        fn to_json(&self) -> Result<Vec<u8>>;
        fn to_msgpack(&self) -> Result<Vec<u8>>;
    }

    impl<T: Serialize> Payload for T {
        fn to_json(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(self)?)
        }

        fn to_msgpack(&self) -> Result<Vec<u8>> {
            Ok(rmp_serde::to_vec_named(self)?)
        }
    }
}

fn decode_with<F>(kind: MessageType, decode: F) -> Result<Message>
where
    F: DecodeFn,
{
    Ok(match kind {
        MessageType::Request => Message::Request(decode.decode()?),
        MessageType::Response => Message::Response(decode.decode()?),
        MessageType::HeartbeatRequest => Message::HeartbeatRequest(decode.decode()?),
        MessageType::HeartbeatResponse => Message::HeartbeatResponse(decode.decode()?),
    })
}

trait DecodeFn {
    fn decode<T: DeserializeOwned>(&self) -> Result<T>;
}

struct JsonBytes<'a>(&'a [u8]);

impl DecodeFn for JsonBytes<'_> {
    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.0)?)
    }
}

struct MsgPackBytes<'a>(&'a [u8]);

impl DecodeFn for MsgPackBytes<'_> {
    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(self.0)?)
    }
}

/// JSON serializer (id 0).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        encode_with(message, |payload| payload.to_json())
    }

    fn deserialize(&self, kind: MessageType, bytes: &[u8]) -> Result<Message> {
        decode_with(kind, JsonBytes(bytes))
    }
}

/// MessagePack serializer (id 1).
///
/// Structs are written as maps so fields survive reordering between versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        encode_with(message, |payload| payload.to_msgpack())
    }

    fn deserialize(&self, kind: MessageType, bytes: &[u8]) -> Result<Message> {
        decode_with(kind, MsgPackBytes(bytes))
    }
}

/// Serializers keyed by id and by name.
#[derive(Clone)]
pub struct SerializerRegistry {
    by_id: HashMap<u8, Arc<dyn Serializer>>,
    by_name: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// An empty registry. Use [`Default`] for one with the built-ins.
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Adds a serializer. Ids must fit in a nibble and both id and name must be unused.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> Result<()> {
        let id = serializer.id();
        let name = serializer.name().to_ascii_lowercase();
        if id > MAX_CODEC_ID {
            return Err(CadeError::Config(format!(
                "serializer id {} exceeds {}",
                id, MAX_CODEC_ID
            )));
        }
        if self.by_id.contains_key(&id) {
            return Err(CadeError::Config(format!("duplicate serializer id {}", id)));
        }
        if self.by_name.contains_key(&name) {
            return Err(CadeError::Config(format!("duplicate serializer name '{}'", name)));
        }
        self.by_id.insert(id, serializer.clone());
        self.by_name.insert(name, serializer);
        Ok(())
    }

    pub fn by_id(&self, id: u8) -> Result<Arc<dyn Serializer>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or(CadeError::UnsupportedCodec { kind: "serializer", code: id })
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Serializer>> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CadeError::Config(format!("unknown serializer '{}'", name)))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut by_id: HashMap<u8, Arc<dyn Serializer>> = HashMap::new();
        let mut by_name: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
        let builtins: [Arc<dyn Serializer>; 2] = [Arc::new(JsonSerializer), Arc::new(MsgPackSerializer)];
        for serializer in builtins {
            by_id.insert(serializer.id(), serializer.clone());
            by_name.insert(serializer.name().to_string(), serializer);
        }
        Self { by_id, by_name }
    }
}
