//! The decryption-oracle protocol.
//!
//! Withdrawals settle in two phases: the ledger debits synchronously and
//! hands the encrypted amount to an oracle (Phase 1); the oracle later posts
//! back the plaintext together with signatures over it (Phase 2). This
//! module defines that boundary: signing keys and size-validated signatures
//! (CRYSTALS-Dilithium5), the [`SignerSet`] the ledger verifies callbacks
//! against, the [`DecryptionOracle`] trait the ledger drives, and
//! [`LocalOracle`], an in-process oracle that decrypts through
//! [`PlainEngine`] and signs its own callbacks: the full settlement loop
//! without a real multi-party network.
//!
//! The wire format between a deployment and a real oracle network is out of
//! scope; only the protocol obligations are fixed here: a callback carries
//! `(correlation_id, plaintext, signatures)`, signatures cover the
//! domain-separated digest of the first two, and the ledger accepts each
//! correlation id at most once.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{CipherError, CtHandle, PlainEngine, Principal};
use crate::Hash;

// Expected sizes for validation
const DILITHIUM5_PK_BYTES: usize = 2592;
const DILITHIUM5_SIG_BYTES: usize = 4627;

/// Errors from oracle operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OracleError {
    #[error("unknown correlation id {0}")]
    UnknownCorrelation(u64),
    #[error("decryption failed: {0}")]
    Decryption(#[from] CipherError),
}

/// A Dilithium5 oracle signing public key (2592 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`OracleKeypair::generate`] or deserialization.
#[derive(Clone, Debug)]
pub struct OraclePublicKey(pub(crate) Vec<u8>);

/// A Dilithium5 oracle signing secret key.
///
/// Inner bytes are `pub(crate)` so external crates cannot read or construct
/// secret keys directly; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OracleSecretKey(pub(crate) Vec<u8>);

/// A Dilithium5 detached signature over a callback digest.
#[derive(Clone, Debug)]
pub struct OracleSignature(pub(crate) Vec<u8>);

impl OracleSignature {
    /// An empty signature; always fails verification.
    pub fn empty() -> Self {
        OracleSignature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for OracleSignature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for OracleSignature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Allow empty (explicitly invalid) signatures; reject anything else
        // that is not exactly one Dilithium5 signature, preventing memory
        // exhaustion via oversized blobs.
        if !bytes.is_empty() && bytes.len() != DILITHIUM5_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 signature: expected {} bytes, got {}",
                DILITHIUM5_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(OracleSignature(bytes))
    }
}

impl OraclePublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &OracleSignature) -> bool {
        let pk = match dilithium5::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match dilithium5::DetachedSignature::from_bytes(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// Compact fingerprint (BLAKE3 hash of the public key).
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"cachet.oracle.fingerprint", &self.0)
    }
}

impl Serialize for OraclePublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for OraclePublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != DILITHIUM5_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 public key: expected {} bytes, got {}",
                DILITHIUM5_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(OraclePublicKey(bytes))
    }
}

/// A Dilithium5 oracle signing keypair.
#[derive(Clone)]
pub struct OracleKeypair {
    pub public: OraclePublicKey,
    pub secret: OracleSecretKey,
}

impl OracleKeypair {
    /// Generate a new random Dilithium5 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        OracleKeypair {
            public: OraclePublicKey(pk.as_bytes().to_vec()),
            secret: OracleSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// If the internal secret key is somehow corrupted, logs an error and
    /// returns an empty signature instead of panicking. An empty signature
    /// always fails verification, so no security property is lost.
    pub fn sign(&self, message: &[u8]) -> OracleSignature {
        let sk = match dilithium5::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("OracleKeypair::sign called with corrupted secret key");
                return OracleSignature::empty();
            }
        };
        let sig = dilithium5::detached_sign(message, &sk);
        OracleSignature(sig.as_bytes().to_vec())
    }
}

/// The payload an oracle posts back to settle one decryption request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleCallback {
    pub correlation_id: u64,
    pub plaintext: u64,
    pub signatures: Vec<OracleSignature>,
}

impl OracleCallback {
    /// The digest oracle signers commit to: domain-separated hash of
    /// `(correlation_id, plaintext)`.
    pub fn digest(correlation_id: u64, plaintext: u64) -> Hash {
        crate::hash_domain(
            b"cachet.oracle.callback",
            &crate::hash_concat(&[&correlation_id.to_le_bytes(), &plaintext.to_le_bytes()]),
        )
    }
}

/// The set of oracle signers a deployment trusts, with the number of
/// distinct valid signatures a callback must carry.
#[derive(Clone)]
pub struct SignerSet {
    signers: Vec<OraclePublicKey>,
    threshold: usize,
}

impl SignerSet {
    /// Build a signer set. The threshold is clamped into
    /// `1..=signers.len()`.
    pub fn new(signers: Vec<OraclePublicKey>, threshold: usize) -> Self {
        let max = signers.len().max(1);
        SignerSet {
            signers,
            threshold: threshold.clamp(1, max),
        }
    }

    /// Number of distinct known signers required per callback.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Verify a callback's signatures: at least `threshold` of them must be
    /// valid signatures over the callback digest by *distinct* known
    /// signers. Extra or unknown signatures are ignored rather than fatal.
    pub fn verify(&self, callback: &OracleCallback) -> bool {
        let digest = OracleCallback::digest(callback.correlation_id, callback.plaintext);
        let mut seen: Vec<usize> = Vec::new();
        for sig in &callback.signatures {
            for (idx, signer) in self.signers.iter().enumerate() {
                if seen.contains(&idx) {
                    continue;
                }
                if signer.verify(&digest, sig) {
                    seen.push(idx);
                    break;
                }
            }
            if seen.len() >= self.threshold {
                return true;
            }
        }
        false
    }
}

/// The oracle boundary the ledger drives during Phase 1.
pub trait DecryptionOracle {
    /// Register encrypted handles for asynchronous decryption. Returns the
    /// correlation id the eventual callback will carry.
    fn request_decryption(&mut self, handles: &[CtHandle]) -> u64;
}

/// In-process oracle: a pending-request table plus signing keys.
///
/// `fulfill` decrypts a pending request through the plaintext engine (which
/// enforces that the ledger granted the oracle decrypt rights) and emits a
/// signed callback. Keys and pending requests are operator material, not
/// protocol state; neither is persisted across restarts.
pub struct LocalOracle {
    keys: Vec<OracleKeypair>,
    pending: std::collections::HashMap<u64, Vec<CtHandle>>,
    next_correlation: u64,
}

impl LocalOracle {
    /// Create an oracle signing with the given keypairs.
    pub fn new(keys: Vec<OracleKeypair>) -> Self {
        LocalOracle {
            keys,
            pending: std::collections::HashMap::new(),
            next_correlation: 0,
        }
    }

    /// Create an oracle with a single freshly generated keypair.
    pub fn single() -> Self {
        Self::new(vec![OracleKeypair::generate()])
    }

    /// Public keys of this oracle's signers.
    pub fn public_keys(&self) -> Vec<OraclePublicKey> {
        self.keys.iter().map(|k| k.public.clone()).collect()
    }

    /// The signer set a ledger should verify this oracle's callbacks with.
    pub fn signer_set(&self, threshold: usize) -> SignerSet {
        SignerSet::new(self.public_keys(), threshold)
    }

    /// Number of requests awaiting fulfillment.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Correlation ids of all requests awaiting fulfillment.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Decrypt a pending request and emit the signed callback.
    ///
    /// Sums the decrypted handles (a withdrawal registers exactly one, but
    /// the request interface is batch-shaped). The pending entry is removed
    /// on success; decryption failure leaves it queued.
    pub fn fulfill(
        &mut self,
        correlation_id: u64,
        engine: &PlainEngine,
    ) -> Result<OracleCallback, OracleError> {
        let handles = self
            .pending
            .get(&correlation_id)
            .ok_or(OracleError::UnknownCorrelation(correlation_id))?;

        let mut plaintext: u64 = 0;
        for &handle in handles {
            plaintext = plaintext.wrapping_add(engine.decrypt(handle, Principal::Oracle)?);
        }
        self.pending.remove(&correlation_id);

        let digest = OracleCallback::digest(correlation_id, plaintext);
        let signatures = self.keys.iter().map(|k| k.sign(&digest)).collect();
        Ok(OracleCallback {
            correlation_id,
            plaintext,
            signatures,
        })
    }
}

impl DecryptionOracle for LocalOracle {
    fn request_decryption(&mut self, handles: &[CtHandle]) -> u64 {
        let correlation_id = self.next_correlation;
        self.next_correlation += 1;
        self.pending.insert(correlation_id, handles.to_vec());
        tracing::debug!(correlation_id, count = handles.len(), "decryption requested");
        correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CiphertextOps, EncryptionContext};
    use crate::Address;

    fn ctx() -> EncryptionContext {
        EncryptionContext {
            contract: Address::from_seed(b"contract"),
            sender: Address::from_seed(b"sender"),
        }
    }

    #[test]
    fn sign_and_verify_callback() {
        let key = OracleKeypair::generate();
        let digest = OracleCallback::digest(7, 500);
        let sig = key.sign(&digest);
        assert!(key.public.verify(&digest, &sig));
        assert!(!key.public.verify(&OracleCallback::digest(7, 501), &sig));
    }

    #[test]
    fn empty_signature_fails_verification() {
        let key = OracleKeypair::generate();
        let digest = OracleCallback::digest(1, 1);
        assert!(!key.public.verify(&digest, &OracleSignature::empty()));
    }

    #[test]
    fn signer_set_threshold() {
        let a = OracleKeypair::generate();
        let b = OracleKeypair::generate();
        let set = SignerSet::new(vec![a.public.clone(), b.public.clone()], 2);
        let digest = OracleCallback::digest(3, 42);

        let full = OracleCallback {
            correlation_id: 3,
            plaintext: 42,
            signatures: vec![a.sign(&digest), b.sign(&digest)],
        };
        assert!(set.verify(&full));

        let short = OracleCallback {
            correlation_id: 3,
            plaintext: 42,
            signatures: vec![a.sign(&digest)],
        };
        assert!(!set.verify(&short), "one of two required signatures");

        // The same signer twice must not satisfy a threshold of two.
        let duplicated = OracleCallback {
            correlation_id: 3,
            plaintext: 42,
            signatures: vec![a.sign(&digest), a.sign(&digest)],
        };
        assert!(!set.verify(&duplicated));
    }

    #[test]
    fn signer_set_rejects_unknown_signer() {
        let known = OracleKeypair::generate();
        let rogue = OracleKeypair::generate();
        let set = SignerSet::new(vec![known.public.clone()], 1);
        let digest = OracleCallback::digest(9, 9);
        let cb = OracleCallback {
            correlation_id: 9,
            plaintext: 9,
            signatures: vec![rogue.sign(&digest)],
        };
        assert!(!set.verify(&cb));
    }

    #[test]
    fn local_oracle_fulfills_with_grant() {
        let mut engine = PlainEngine::new();
        let handle = engine.encrypt(777, &ctx());
        engine.allow(handle, Principal::Oracle).unwrap();

        let mut oracle = LocalOracle::single();
        let cid = oracle.request_decryption(&[handle]);
        assert_eq!(oracle.pending_count(), 1);

        let cb = oracle.fulfill(cid, &engine).unwrap();
        assert_eq!(cb.plaintext, 777);
        assert_eq!(oracle.pending_count(), 0);
        assert!(oracle.signer_set(1).verify(&cb));
    }

    #[test]
    fn local_oracle_without_grant_fails() {
        let mut engine = PlainEngine::new();
        let handle = engine.encrypt(5, &ctx());
        // Ledger never granted Principal::Oracle.
        let mut oracle = LocalOracle::single();
        let cid = oracle.request_decryption(&[handle]);
        match oracle.fulfill(cid, &engine) {
            Err(OracleError::Decryption(CipherError::AccessDenied)) => {}
            other => panic!("expected AccessDenied, got {:?}", other),
        }
        // Request remains queued for a retry after the grant is fixed.
        assert_eq!(oracle.pending_count(), 1);
    }

    #[test]
    fn unknown_correlation_id() {
        let engine = PlainEngine::new();
        let mut oracle = LocalOracle::single();
        assert!(matches!(
            oracle.fulfill(99, &engine),
            Err(OracleError::UnknownCorrelation(99))
        ));
    }

    #[test]
    fn signature_deserialize_rejects_bad_size() {
        let bogus = crate::serialize(&vec![0u8; 100]).unwrap();
        assert!(crate::deserialize::<OracleSignature>(&bogus).is_err());
        let empty = crate::serialize(&Vec::<u8>::new()).unwrap();
        assert!(crate::deserialize::<OracleSignature>(&empty).is_ok());
    }
}
