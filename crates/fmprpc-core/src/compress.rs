//! Payload compression for compressed calls and their replies.
//!
//! The caller picks a [`CompressionType`] per call; the type travels in the
//! `CallCompressed` frame so the callee picks the matching decompressor.
//! Each transport owns one [`CompressorCache`], which builds every algorithm
//! at most once.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rmpv::Value;
use serde::Serialize;

use crate::codec::{value_from_bytes, value_to_bytes};
use crate::error::{Result, RpcError};
use crate::message::CompressionType;

/// A payload compression algorithm.
pub trait Compressor: Send + Sync {
    fn compression_type(&self) -> CompressionType;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through.
#[derive(Debug, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// gzip via `flate2`.
#[derive(Debug)]
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }
}

impl GzipCompressor {
    fn error(reason: impl std::fmt::Display) -> RpcError {
        RpcError::Compression {
            compression: CompressionType::Gzip,
            reason: reason.to_string(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data).map_err(Self::error)?;
        encoder.finish().map_err(Self::error)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(Self::error)?;
        Ok(out)
    }
}

const MSGPACKZIP_VERBATIM: u64 = 0;
const MSGPACKZIP_KEYED: u64 = 1;

/// msgpack-aware compactor.
///
/// Map keys that are strings and occur more than once anywhere in the value
/// are swapped for their index in a dictionary. The output is the envelope
/// `[1, [key0, key1, ...], compacted]`. Inputs that already use integer map
/// keys are stored as `[0, value]`.
#[derive(Debug, Default)]
pub struct MsgpackzipCompressor;

impl MsgpackzipCompressor {
    fn error(reason: impl std::fmt::Display) -> RpcError {
        RpcError::Compression {
            compression: CompressionType::Msgpackzip,
            reason: reason.to_string(),
        }
    }

    fn count_keys(value: &Value, counts: &mut HashMap<String, usize>) -> bool {
        match value {
            Value::Map(entries) => {
                for (k, v) in entries {
                    match k {
                        Value::Integer(_) => return false,
                        Value::String(s) => {
                            if let Some(s) = s.as_str() {
                                *counts.entry(s.to_string()).or_insert(0) += 1;
                            }
                        }
                        _ => {}
                    }
                    if !Self::count_keys(k, counts) || !Self::count_keys(v, counts) {
                        return false;
                    }
                }
                true
            }
            Value::Array(items) => items.iter().all(|item| Self::count_keys(item, counts)),
            _ => true,
        }
    }

    fn compact(value: Value, index: &HashMap<String, u64>) -> Value {
        match value {
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| {
                        let key = match k.as_str().and_then(|s| index.get(s)) {
                            Some(i) => Value::from(*i),
                            None => Self::compact(k, index),
                        };
                        (key, Self::compact(v, index))
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| Self::compact(v, index)).collect())
            }
            other => other,
        }
    }

    fn expand(value: Value, dictionary: &[Value]) -> Result<Value> {
        match value {
            Value::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = match k.as_u64() {
                        Some(i) => dictionary
                            .get(i as usize)
                            .cloned()
                            .ok_or_else(|| Self::error(format!("dictionary index {} out of range", i)))?,
                        None => Self::expand(k, dictionary)?,
                    };
                    out.push((key, Self::expand(v, dictionary)?));
                }
                Ok(Value::Map(out))
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| Self::expand(v, dictionary))
                    .collect::<Result<Vec<_>>>()?,
            )),
            other => Ok(other),
        }
    }
}

impl Compressor for MsgpackzipCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Msgpackzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let value = value_from_bytes(data).map_err(Self::error)?;
        let mut counts = HashMap::new();
        if !Self::count_keys(&value, &mut counts) {
            return value_to_bytes(&Value::Array(vec![Value::from(MSGPACKZIP_VERBATIM), value]));
        }
        let mut keys: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let index: HashMap<String, u64> = keys
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.clone(), i as u64))
            .collect();
        let dictionary = keys.into_iter().map(|(k, _)| Value::from(k)).collect();
        let envelope = Value::Array(vec![
            Value::from(MSGPACKZIP_KEYED),
            Value::Array(dictionary),
            Self::compact(value, &index),
        ]);
        value_to_bytes(&envelope)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let fields = match value_from_bytes(data).map_err(Self::error)? {
            Value::Array(fields) => fields,
            _ => return Err(Self::error("envelope is not an array")),
        };
        let mut fields = fields.into_iter();
        let version = fields.next().and_then(|v| v.as_u64());
        let value = match version {
            Some(MSGPACKZIP_VERBATIM) => fields.next().unwrap_or(Value::Nil),
            Some(MSGPACKZIP_KEYED) => {
                let dictionary = match fields.next() {
                    Some(Value::Array(keys)) => keys,
                    _ => return Err(Self::error("missing key dictionary")),
                };
                let compacted = fields.next().unwrap_or(Value::Nil);
                Self::expand(compacted, &dictionary)?
            }
            _ => return Err(Self::error("unknown envelope version")),
        };
        value_to_bytes(&value)
    }
}

/// Snapshot of compressor cache activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStatsSnapshot {
    /// Total bytes input to compression.
    pub bytes_in: u64,
    /// Total bytes output from compression.
    pub bytes_out: u64,
    /// Number of compressions performed.
    pub compressions: u64,
    /// Number of decompressions performed.
    pub decompressions: u64,
}

#[derive(Debug, Default)]
struct CompressionStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    compressions: AtomicU64,
    decompressions: AtomicU64,
}

/// Lazily builds one compressor per algorithm.
#[derive(Default)]
pub struct CompressorCache {
    compressors: Mutex<HashMap<CompressionType, Arc<dyn Compressor>>>,
    stats: CompressionStats,
}

impl std::fmt::Debug for CompressorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CompressorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compressor for `ct`, building it on first use.
    pub fn get(&self, ct: CompressionType) -> Arc<dyn Compressor> {
        let mut compressors = self
            .compressors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        compressors
            .entry(ct)
            .or_insert_with(|| match ct {
                CompressionType::None => Arc::new(NoCompression),
                CompressionType::Gzip => Arc::new(GzipCompressor::default()),
                CompressionType::Msgpackzip => Arc::new(MsgpackzipCompressor),
            })
            .clone()
    }

    /// Number of algorithms instantiated so far.
    pub fn len(&self) -> usize {
        self.compressors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Msgpack-encodes `value` and compresses the bytes.
    pub fn compress_value(&self, ct: CompressionType, value: &Value) -> Result<Vec<u8>> {
        let raw = value_to_bytes(value)?;
        let out = self.get(ct).compress(&raw)?;
        self.stats
            .bytes_in
            .fetch_add(raw.len() as u64, Ordering::Relaxed);
        self.stats
            .bytes_out
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        self.stats.compressions.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// Reverses [`compress_value`](Self::compress_value). An empty payload
    /// is an absent value and decodes to nil.
    pub fn decompress_value(&self, ct: CompressionType, data: &[u8]) -> Result<Value> {
        if data.is_empty() {
            return Ok(Value::Nil);
        }
        let raw = self.get(ct).decompress(data)?;
        self.stats.decompressions.fetch_add(1, Ordering::Relaxed);
        value_from_bytes(&raw)
    }

    pub fn stats(&self) -> CompressionStatsSnapshot {
        CompressionStatsSnapshot {
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            compressions: self.stats.compressions.load(Ordering::Relaxed),
            decompressions: self.stats.decompressions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: i64) -> Value {
        Value::Map(vec![
            (Value::from("name"), Value::from(format!("entry-{}", i))),
            (Value::from("size"), Value::from(i * 100)),
            (Value::from("writer"), Value::from("alice")),
        ])
    }

    #[test]
    fn test_gzip_shrinks_repetitive_data() {
        let gz = GzipCompressor::default();
        let data = vec![b'a'; 4096];
        let compressed = gz.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(gz.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let err = GzipCompressor::default().decompress(b"not gzip").unwrap_err();
        assert!(matches!(
            err,
            RpcError::Compression {
                compression: CompressionType::Gzip,
                ..
            }
        ));
    }

    #[test]
    fn test_msgpackzip_compacts_repeated_keys() {
        let value = Value::Array((0..20).map(record).collect());
        let raw = value_to_bytes(&value).unwrap();
        let zip = MsgpackzipCompressor;
        let compressed = zip.compress(&raw).unwrap();
        assert!(compressed.len() < raw.len());
        let restored = value_from_bytes(&zip.decompress(&compressed).unwrap()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_msgpackzip_keeps_integer_keyed_maps_verbatim() {
        let value = Value::Map(vec![
            (Value::from(0), Value::from("zero")),
            (Value::from("x"), record(1)),
        ]);
        let raw = value_to_bytes(&value).unwrap();
        let zip = MsgpackzipCompressor;
        let restored = value_from_bytes(&zip.decompress(&zip.compress(&raw).unwrap()).unwrap()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_msgpackzip_bad_index() {
        let envelope = Value::Array(vec![
            Value::from(1),
            Value::Array(vec![Value::from("a")]),
            Value::Map(vec![(Value::from(5), Value::Nil)]),
        ]);
        let err = MsgpackzipCompressor
            .decompress(&value_to_bytes(&envelope).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_cache_instantiates_once() {
        let cache = CompressorCache::new();
        assert!(cache.is_empty());
        let a = cache.get(CompressionType::Gzip);
        let b = cache.get(CompressionType::Gzip);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        cache.get(CompressionType::Msgpackzip);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_value_round_trip_and_stats() {
        let cache = CompressorCache::new();
        let value = Value::Array((0..5).map(record).collect());
        for ct in [
            CompressionType::None,
            CompressionType::Gzip,
            CompressionType::Msgpackzip,
        ] {
            let bytes = cache.compress_value(ct, &value).unwrap();
            assert_eq!(cache.decompress_value(ct, &bytes).unwrap(), value);
        }
        let stats = cache.stats();
        assert_eq!(stats.compressions, 3);
        assert_eq!(stats.decompressions, 3);
    }

    #[test]
    fn test_empty_payload_is_absent() {
        let cache = CompressorCache::new();
        assert_eq!(
            cache.decompress_value(CompressionType::Gzip, &[]).unwrap(),
            Value::Nil
        );
        assert_eq!(cache.stats().decompressions, 0);
    }
}
