//! Payload compressors
//!
//! A compressor only runs when [`Compressor::needs_compression`] says the
//! payload is big enough; otherwise the frame is written with compress code
//! `0` ("stored"). Small control messages such as heartbeats never pay the
//! compressor's fixed overhead.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::serialize::MAX_CODEC_ID;
use crate::protocol::error::{CadeError, Result};

/// Compress code meaning the payload is stored as-is.
pub const STORED: u8 = 0;

const GZIP_THRESHOLD: usize = 512;
const ZSTD_THRESHOLD: usize = 256;
const ZSTD_LEVEL: i32 = 3;

/// Payload compressor extension point.
pub trait Compressor: Send + Sync {
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Whether `payload` is large enough to be worth compressing.
    fn needs_compression(&self, payload: &[u8]) -> bool;

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Restores `payload`, failing once the output would exceed `limit` bytes.
    fn decompress(&self, payload: &[u8], limit: usize) -> Result<Vec<u8>>;
}

/// Drains `decoder` into a buffer of at most `limit` bytes.
fn read_bounded<R: Read>(decoder: R, limit: usize, name: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| CadeError::Compression(format!("{}: {}", name, e)))?;
    if out.len() > limit {
        return Err(CadeError::Compression(format!(
            "{}: decompressed payload exceeds limit of {} bytes",
            name, limit
        )));
    }
    Ok(out)
}

/// Identity compressor (id 0).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn id(&self) -> u8 {
        STORED
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn needs_compression(&self, _payload: &[u8]) -> bool {
        false
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decompress(&self, payload: &[u8], limit: usize) -> Result<Vec<u8>> {
        read_bounded(payload, limit, "none")
    }
}

/// Gzip compressor (id 1), used for payloads of 512 bytes or more.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    threshold: usize,
}

impl GzipCompressor {
    pub fn with_threshold(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::with_threshold(GZIP_THRESHOLD)
    }
}

impl Compressor for GzipCompressor {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn needs_compression(&self, payload: &[u8]) -> bool {
        payload.len() >= self.threshold
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(payload)
            .map_err(|e| CadeError::Compression(format!("gzip: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CadeError::Compression(format!("gzip: {}", e)))
    }

    fn decompress(&self, payload: &[u8], limit: usize) -> Result<Vec<u8>> {
        read_bounded(GzDecoder::new(payload), limit, "gzip")
    }
}

/// Zstandard compressor (id 2), used for payloads of 256 bytes or more.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    threshold: usize,
    level: i32,
}

impl ZstdCompressor {
    pub fn new(threshold: usize, level: i32) -> Self {
        Self { threshold, level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(ZSTD_THRESHOLD, ZSTD_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn needs_compression(&self, payload: &[u8]) -> bool {
        payload.len() >= self.threshold
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(payload, self.level)
            .map_err(|e| CadeError::Compression(format!("zstd: {}", e)))
    }

    fn decompress(&self, payload: &[u8], limit: usize) -> Result<Vec<u8>> {
        let decoder = zstd::stream::read::Decoder::new(payload)
            .map_err(|e| CadeError::Compression(format!("zstd: {}", e)))?;
        read_bounded(decoder, limit, "zstd")
    }
}

/// Compressors keyed by id and by name.
#[derive(Clone)]
pub struct CompressorRegistry {
    by_id: HashMap<u8, Arc<dyn Compressor>>,
    by_name: HashMap<String, Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, compressor: Arc<dyn Compressor>) -> Result<()> {
        let id = compressor.id();
        let name = compressor.name().to_ascii_lowercase();
        if id > MAX_CODEC_ID {
            return Err(CadeError::Config(format!(
                "compressor id {} exceeds {}",
                id, MAX_CODEC_ID
            )));
        }
        if self.by_id.contains_key(&id) {
            return Err(CadeError::Config(format!("duplicate compressor id {}", id)));
        }
        if self.by_name.contains_key(&name) {
            return Err(CadeError::Config(format!("duplicate compressor name '{}'", name)));
        }
        self.by_id.insert(id, compressor.clone());
        self.by_name.insert(name, compressor);
        Ok(())
    }

    pub fn by_id(&self, id: u8) -> Result<Arc<dyn Compressor>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or(CadeError::UnsupportedCodec { kind: "compressor", code: id })
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Compressor>> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CadeError::Config(format!("unknown compressor '{}'", name)))
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let builtins: [Arc<dyn Compressor>; 3] = [
            Arc::new(NoneCompressor),
            Arc::new(GzipCompressor::default()),
            Arc::new(ZstdCompressor::default()),
        ];
        for compressor in builtins {
            registry.by_id.insert(compressor.id(), compressor.clone());
            registry.by_name.insert(compressor.name().to_string(), compressor);
        }
        registry
    }
}
