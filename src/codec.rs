//! Chunk codec: fixed-width packing of UTF-8 text for chunk-wise encryption.
//!
//! Text is split into groups of up to 8 bytes; each group is packed
//! little-endian into one u64 (byte *i* occupies bits `[8i, 8i+8)`), the
//! final group implicitly zero-padded. The inverse unpacks 8 bytes per chunk
//! and **drops every 0x00 byte** before UTF-8 decoding, since padding and genuine
//! NUL bytes are indistinguishable at this layer, so messages containing
//! embedded NULs do not round-trip. That lossiness is a known protocol
//! limitation; changing it would break existing ciphertexts.
//!
//! Inputs longer than [`constants::MAX_TEXT_BYTES`] are rejected loudly
//! instead of being truncated.
//!
//! The module also provides [`EncryptCache`], a bounded TTL cache that
//! deduplicates chunk-encryption requests keyed by `(chunk, context)`, since
//! re-encrypting identical chunks for the same (contract, sender) binding
//! within a short window is pure waste.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cipher::{CtHandle, EncryptionContext};
use crate::constants;

/// Errors from chunk encoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message text is empty")]
    Empty,
    #[error("message text is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },
}

/// Pack UTF-8 text into little-endian u64 chunks.
///
/// Produces between 1 and [`constants::MAX_CHUNKS`] chunks. Empty input and
/// input over [`constants::MAX_TEXT_BYTES`] are rejected.
pub fn encode(text: &str) -> Result<Vec<u64>, CodecError> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    if bytes.len() > constants::MAX_TEXT_BYTES {
        return Err(CodecError::TooLong {
            len: bytes.len(),
            max: constants::MAX_TEXT_BYTES,
        });
    }

    let chunks = bytes
        .chunks(constants::CHUNK_BYTES)
        .map(|group| {
            let mut packed = 0u64;
            for (i, &b) in group.iter().enumerate() {
                packed |= (b as u64) << (8 * i);
            }
            packed
        })
        .collect();
    Ok(chunks)
}

/// Unpack u64 chunks back into text.
///
/// Extracts 8 bytes per chunk at offsets 0..7, drops 0x00 bytes (padding is
/// indistinguishable from embedded NULs), and UTF-8 decodes the result. On
/// invalid UTF-8 each byte is mapped to its Unicode code point instead of
/// failing, so decoding always yields *some* text.
pub fn decode(chunks: &[u64]) -> String {
    let mut bytes = Vec::with_capacity(chunks.len() * constants::CHUNK_BYTES);
    for &chunk in chunks {
        for i in 0..constants::CHUNK_BYTES {
            let b = (chunk >> (8 * i)) as u8;
            if b != 0x00 {
                bytes.push(b);
            }
        }
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(
                len = e.as_bytes().len(),
                "chunk payload is not valid UTF-8, mapping bytes to code points"
            );
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    }
}

/// Cache key: one plaintext chunk bound to its encryption context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub chunk: u64,
    pub context: EncryptionContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    handle: CtHandle,
    inserted_at: u64,
}

/// Bounded TTL cache for chunk-encryption requests.
///
/// Entries expire after `ttl_secs`; when an insert would exceed `capacity`,
/// an arbitrary existing entry is evicted (HashMap iteration order, not
/// true LRU, which the dedup use case does not need). Time is supplied by
/// the caller as unix seconds so behavior is deterministic under test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptCache {
    ttl_secs: u64,
    capacity: usize,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl EncryptCache {
    /// Create a cache with the given TTL and capacity.
    pub fn new(ttl_secs: u64, capacity: usize) -> Self {
        EncryptCache {
            ttl_secs,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Create a cache with the protocol default TTL and capacity.
    pub fn with_defaults() -> Self {
        Self::new(
            constants::ENCRYPT_CACHE_TTL_SECS,
            constants::ENCRYPT_CACHE_CAPACITY,
        )
    }

    /// Look up a live entry, dropping it if expired.
    pub fn get(&mut self, key: &CacheKey, now: u64) -> Option<CtHandle> {
        match self.entries.get(key) {
            Some(entry) if now.saturating_sub(entry.inserted_at) < self.ttl_secs => {
                Some(entry.handle)
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert an entry, evicting an arbitrary existing one when at capacity.
    pub fn insert(&mut self, key: CacheKey, handle: CtHandle, now: u64) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            // Prefer evicting something already expired; otherwise any entry.
            let victim = self
                .entries
                .iter()
                .find(|(_, e)| now.saturating_sub(e.inserted_at) >= self.ttl_secs)
                .or_else(|| self.entries.iter().next())
                .map(|(k, _)| *k);
            if let Some(victim) = victim {
                tracing::debug!(?victim, "encrypt cache full, evicting entry");
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                handle,
                inserted_at: now,
            },
        );
    }

    /// Current number of entries (live or expired-but-unswept).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
