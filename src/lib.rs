//! # Cachet
//!
//! A confidential-value settlement and chunked-message protocol core:
//! - **Encrypted balances**: all arithmetic runs through an injected
//!   homomorphic capability ([`cipher::CiphertextOps`]); plaintext amounts
//!   never touch the ledger
//! - **Branchless conditionals**: insufficient-balance transfers move zero
//!   value via `select` instead of branching on a secret comparison
//! - **Two-phase settlement**: withdrawals debit synchronously, then settle
//!   through a signed, idempotent decryption-oracle callback
//! - **Chunked messaging**: UTF-8 text packed into fixed-width encrypted
//!   chunks, indexed per user in fixed-capacity pages
//! - **Red packets**: time-bound conditional value transfer on the same
//!   ledger primitives
//!
//! The crate is a protocol core, not a node: wallet connectivity, transport
//! to a real decryption-oracle network, and any UI live outside it. The
//! [`cipher::PlainEngine`] implementation drives the entire test suite with
//! plaintext arithmetic behind the identical interface.

pub mod cipher;
pub mod codec;
pub mod config;
pub mod ledger;
pub mod messages;
pub mod oracle;
pub mod redpacket;
pub mod service;
pub mod storage;

/// Protocol constants
pub mod constants {
    /// Bytes packed into one chunk (one little-endian u64).
    pub const CHUNK_BYTES: usize = 8;
    /// Maximum chunks per message.
    pub const MAX_CHUNKS: usize = 64;
    /// Maximum encodable text length in bytes (MAX_CHUNKS * CHUNK_BYTES).
    pub const MAX_TEXT_BYTES: usize = MAX_CHUNKS * CHUNK_BYTES;
    /// Message ids per page of the per-user index.
    pub const PAGE_CAPACITY: usize = 50;
    /// Upper bound on the `limit` parameter of latest-message queries.
    pub const MAX_QUERY_LIMIT: usize = 100;
    /// Default number of messages returned by the plain "latest" query.
    pub const DEFAULT_LATEST_LIMIT: usize = 10;
    /// Smallest plaintext amount a withdrawal callback may settle.
    pub const MIN_WITHDRAW: u64 = 1;
    /// Largest plaintext amount a withdrawal callback may settle.
    pub const MAX_WITHDRAW: u64 = 1_000_000_000_000;
    /// Red packet claim window in seconds (7 days).
    pub const RED_PACKET_LIFETIME_SECS: u64 = 7 * 24 * 3600;
    /// Time-to-live for cached chunk-encryption requests (10 minutes).
    pub const ENCRYPT_CACHE_TTL_SECS: u64 = 600;
    /// Maximum entries in the chunk-encryption cache.
    pub const ENCRYPT_CACHE_CAPACITY: usize = 2000;
    /// Default number of distinct oracle signers a callback must carry.
    pub const ORACLE_SIGNER_THRESHOLD: usize = 1;
    /// Maximum serialized snapshot size accepted on restore (64 MiB).
    pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// A 20-byte account identifier.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive a deterministic address from a seed label. Useful for tests and
    /// demos; real deployments map external account keys onto addresses.
    pub fn from_seed(seed: &[u8]) -> Self {
        let h = hash_domain(b"cachet.address", seed);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&h[..20]);
        Address(bytes)
    }

    /// Access the raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address(0x{}…)", hex::encode(&self.0[..4]))
    }
}

/// Compute a domain-separated BLAKE3 hash.
///
/// Takes `&[u8]` rather than `&str` for ergonomics with `b""` literals.
/// The domain MUST be valid UTF-8 (all Cachet domains use ASCII).
/// Panics at runtime if the domain is not valid UTF-8; that is a programming
/// error, not an input error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// Returns true only if the slices have equal length and identical contents.
/// Uses the `subtle` crate's audited constant-time operations.
///
/// Note: The length comparison is NOT constant-time (leaks whether lengths
/// match). All Cachet uses compare fixed-size hashes and signatures.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_SNAPSHOT_BYTES` to prevent OOM from
/// oversized or malicious payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_SNAPSHOT_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
