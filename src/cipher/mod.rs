//! The encrypted-value capability consumed by every engine.
//!
//! Cachet never implements homomorphic arithmetic itself. All encrypted
//! values are opaque [`CtHandle`]s owned by whatever backend implements
//! [`CiphertextOps`]; the ledger, message store, and red-packet engine only
//! ever combine handles through this trait. The trait is deliberately small:
//! the five arithmetic/comparison operations the protocol needs, plus ACL
//! management (`allow`) and the `is_initialized` probe that distinguishes a
//! never-written balance from a genuine encrypted zero.
//!
//! Two properties every backend must uphold:
//! - `select` is branchless: choosing between two ciphertexts must not
//!   reveal which was chosen, so callers can express conditional effects
//!   without control flow on a secret comparison.
//! - ACL grants do not carry over: each freshly produced handle starts with
//!   no decrypt rights, and mutating code re-issues `allow` for every
//!   principal that should keep access to the new value.
//!
//! [`PlainEngine`] is the in-crate plaintext implementation that drives the
//! test suite with real u64 arithmetic behind the identical interface.

mod plain;

pub use plain::PlainEngine;

use serde::{Deserialize, Serialize};

use crate::{Address, Hash};

/// Errors from cipher-capability operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption proof does not validate")]
    ProofInvalid,
    #[error("unknown ciphertext handle")]
    UnknownHandle,
    #[error("principal holds no decrypt rights on this handle")]
    AccessDenied,
}

/// Opaque reference to one encrypted integer held by the cipher backend.
///
/// Holding a handle alone never grants decryption; rights are tracked
/// per-principal via [`CiphertextOps::allow`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CtHandle(pub(crate) Hash);

impl CtHandle {
    /// Access the raw handle bytes.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl std::fmt::Debug for CtHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CtHandle({}…)", hex::encode(&self.0[..4]))
    }
}

/// Opaque reference to one encrypted boolean (a comparison outcome).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoolHandle(pub(crate) Hash);

impl std::fmt::Debug for BoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoolHandle({}…)", hex::encode(&self.0[..4]))
    }
}

/// A party that may hold decrypt rights on a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// An external account.
    Account(Address),
    /// The confidential ledger itself (needed so it can keep operating on
    /// balances it previously produced).
    Ledger,
    /// The decryption-oracle network (granted on withdrawal amounts so the
    /// oracle may settle them).
    Oracle,
}

/// Binding context for chunk encryption: which contract identity the
/// ciphertext targets and which sender produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub contract: Address,
    pub sender: Address,
}

impl EncryptionContext {
    /// Stable byte encoding used in proof binding and cache keys.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..20].copy_from_slice(self.contract.as_bytes());
        out[20..].copy_from_slice(self.sender.as_bytes());
        out
    }
}

/// The homomorphic-arithmetic capability.
///
/// Arithmetic is wrapping at the underlying 64-bit width; no overflow or
/// underflow signal is exposed, since such a signal would itself leak
/// information about operand magnitudes.
pub trait CiphertextOps {
    /// Import an externally encrypted value. The proof must bind `blob` to
    /// `context`; a proof that does not validate fails with
    /// [`CipherError::ProofInvalid`].
    fn from_external(
        &mut self,
        blob: &[u8],
        proof: &[u8],
        context: &EncryptionContext,
    ) -> Result<CtHandle, CipherError>;

    /// Encrypt a locally known plaintext (the ledger's trusted path for
    /// `enc(amount)` and encrypted zero).
    fn encrypt(&mut self, value: u64, context: &EncryptionContext) -> CtHandle;

    /// Homomorphic addition.
    fn add(&mut self, a: CtHandle, b: CtHandle) -> Result<CtHandle, CipherError>;

    /// Homomorphic subtraction.
    fn sub(&mut self, a: CtHandle, b: CtHandle) -> Result<CtHandle, CipherError>;

    /// Encrypted `a >= b`.
    fn ge(&mut self, a: CtHandle, b: CtHandle) -> Result<BoolHandle, CipherError>;

    /// Branchless conditional: the result equals `if_true` where `cond`
    /// holds and `if_false` otherwise, without revealing which.
    fn select(
        &mut self,
        cond: BoolHandle,
        if_true: CtHandle,
        if_false: CtHandle,
    ) -> Result<CtHandle, CipherError>;

    /// Whether the handle names a value that was ever written. Distinguishes
    /// "never initialized" from a genuine encrypted zero.
    fn is_initialized(&self, handle: CtHandle) -> bool;

    /// Extend the ACL so `principal` may later request decryption of
    /// `handle`. Grants are permanent in this design (no revocation).
    fn allow(&mut self, handle: CtHandle, principal: Principal) -> Result<(), CipherError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_bytes_are_stable() {
        let ctx = EncryptionContext {
            contract: Address::from_seed(b"contract"),
            sender: Address::from_seed(b"sender"),
        };
        let a = ctx.to_bytes();
        let b = ctx.to_bytes();
        assert_eq!(a, b);
        assert_eq!(&a[..20], ctx.contract.as_bytes());
        assert_eq!(&a[20..], ctx.sender.as_bytes());
    }
}
