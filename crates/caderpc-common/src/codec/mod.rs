//! Wire codec
//!
//! Every message travels in one length-prefixed frame (all integers big-endian):
//!
//! ```text
//! +--------+-------+----------+------+-------------------+---------+
//! | i32    | 4 B   | 8 B      | u8   | u8                | ...     |
//! | length | magic | version  | type | ser<<4 | compress | payload |
//! +--------+-------+----------+------+-------------------+---------+
//! ```
//!
//! `length` counts every byte after itself. The magic must be exactly
//! `cade`; anything else means the stream is out of sync and the connection
//! is dropped. Unknown message types or codec ids only fail that one frame,
//! because its length is already known and the next frame can still be read.
//!
//! A [`WireCodec`] is built once per connection with the serializer and
//! compressor negotiated for that connection. Decoding never uses those:
//! it trusts the codes written in each frame.

pub mod compress;
pub mod serialize;

use std::borrow::Cow;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::error::{CadeError, Result};
use crate::protocol::{Message, MessageType};

pub use compress::{
    Compressor, CompressorRegistry, GzipCompressor, NoneCompressor, ZstdCompressor, STORED,
};
pub use serialize::{JsonSerializer, MsgPackSerializer, Serializer, SerializerRegistry};

pub const MAGIC: &[u8; 4] = b"cade";
pub const VERSION: &[u8; 8] = b"10.00.00";

/// Size of the `length` field itself.
pub const LENGTH_FIELD_LEN: usize = 4;
/// Bytes counted by `length` before the payload starts.
pub const HEADER_LEN: usize = MAGIC.len() + VERSION.len() + 2;
/// Default upper bound on `length` (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Connection-scoped frame encoder/decoder.
#[derive(Clone)]
pub struct WireCodec {
    serializer: Arc<dyn Serializer>,
    compressor: Arc<dyn Compressor>,
    serializers: Arc<SerializerRegistry>,
    compressors: Arc<CompressorRegistry>,
    max_frame_length: usize,
}

impl WireCodec {
    /// Builds a codec that writes with the named serializer and compressor.
    pub fn new(
        serializers: Arc<SerializerRegistry>,
        compressors: Arc<CompressorRegistry>,
        serializer: &str,
        compressor: &str,
    ) -> Result<Self> {
        Ok(Self {
            serializer: serializers.by_name(serializer)?,
            compressor: compressors.by_name(compressor)?,
            serializers,
            compressors,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        })
    }

    /// Codec over the built-in registries.
    pub fn with_defaults(serializer: &str, compressor: &str) -> Result<Self> {
        Self::new(
            Arc::new(SerializerRegistry::default()),
            Arc::new(CompressorRegistry::default()),
            serializer,
            compressor,
        )
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn serializer_name(&self) -> &'static str {
        self.serializer.name()
    }

    pub fn compressor_name(&self) -> &'static str {
        self.compressor.name()
    }

    /// Appends one frame for `message` to `dst`.
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let mut payload = self.serializer.serialize(message)?;
        // the peer refuses to inflate anything larger
        if payload.len() > self.max_frame_length {
            return Err(CadeError::Serialization(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                payload.len(),
                self.max_frame_length
            )));
        }
        let mut compress_code = STORED;
        if self.compressor.needs_compression(&payload) {
            payload = self.compressor.compress(&payload)?;
            compress_code = self.compressor.id();
        }

        let length = HEADER_LEN + payload.len();
        if length > self.max_frame_length {
            return Err(CadeError::Serialization(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                length, self.max_frame_length
            )));
        }

        dst.reserve(LENGTH_FIELD_LEN + length);
        dst.put_i32(length as i32);
        dst.put_slice(MAGIC);
        dst.put_slice(VERSION);
        dst.put_u8(message.message_type().code());
        dst.put_u8((self.serializer.id() << 4) | compress_code);
        dst.put_slice(&payload);
        Ok(())
    }

    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Takes the next complete frame off the front of `src`.
    ///
    /// # Returns
    ///
    /// - `Ok(None)` - `src` does not hold a whole frame yet
    /// - `Ok(Some(Ok(message)))` - a decoded message
    /// - `Ok(Some(Err(e)))` - the frame was consumed but its payload could
    ///   not be decoded; the stream is still in sync
    /// - `Err(e)` - framing error, the connection must be closed
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Result<Message>>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length < HEADER_LEN as i32 {
            return Err(CadeError::Framing(format!("frame length {} is too short", length)));
        }
        let length = length as usize;
        if length > self.max_frame_length {
            return Err(CadeError::Framing(format!(
                "frame length {} exceeds limit of {} bytes",
                length, self.max_frame_length
            )));
        }

        if src.len() < LENGTH_FIELD_LEN + length {
            src.reserve(LENGTH_FIELD_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let mut frame = src.split_to(length);

        if &frame[..MAGIC.len()] != MAGIC {
            return Err(CadeError::Framing(format!(
                "bad magic {:02x?}",
                &frame[..MAGIC.len()]
            )));
        }
        frame.advance(MAGIC.len() + VERSION.len());

        let type_code = frame.get_u8();
        let codes = frame.get_u8();
        Ok(Some(self.decode_payload(type_code, codes, &frame)))
    }

    fn decode_payload(&self, type_code: u8, codes: u8, payload: &[u8]) -> Result<Message> {
        let kind = MessageType::try_from(type_code)?;
        let serializer = self.serializers.by_id(codes >> 4)?;
        let compress_code = codes & 0x0F;

        let bytes = if compress_code == STORED {
            Cow::Borrowed(payload)
        } else {
            let compressor = self.compressors.by_id(compress_code)?;
            Cow::Owned(compressor.decompress(payload, self.max_frame_length)?)
        };
        serializer.deserialize(kind, &bytes)
    }
}
