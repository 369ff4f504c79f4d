//! Plaintext reference implementation of the cipher capability.
//!
//! `PlainEngine` performs real u64 arithmetic but hides it behind the same
//! handle-and-ACL interface a homomorphic backend would present. Handles are
//! blake3 digests of a per-engine seed and a monotone counter, so they carry
//! no information about the value they name. The engine is the decryption
//! path for the in-process oracle and for tests; it is not a cryptographic
//! construction and provides no confidentiality against an adversary who can
//! read its memory.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{BoolHandle, CipherError, CiphertextOps, CtHandle, EncryptionContext, Principal};
use crate::{hash_concat, hash_domain, Hash};

/// Plaintext cipher engine: u64 arithmetic behind opaque handles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlainEngine {
    /// Handle-blinding seed, fixed at engine creation.
    seed: Hash,
    /// Monotone counter mixed into each new handle.
    counter: u64,
    /// Integer values by handle.
    values: HashMap<CtHandle, u64>,
    /// Comparison outcomes by handle.
    bools: HashMap<BoolHandle, bool>,
    /// Decrypt rights: handle -> principals granted access.
    acl: HashMap<CtHandle, HashSet<Principal>>,
}

impl PlainEngine {
    /// Create an engine with a random handle-blinding seed.
    pub fn new() -> Self {
        PlainEngine {
            seed: rand::random(),
            counter: 0,
            values: HashMap::new(),
            bools: HashMap::new(),
            acl: HashMap::new(),
        }
    }

    /// Build the proof that binds an external blob to its encryption
    /// context. A client submitting `from_external` input is expected to
    /// attach exactly this digest.
    pub fn prove(blob: &[u8], context: &EncryptionContext) -> Hash {
        hash_domain(
            b"cachet.plain.proof",
            &hash_concat(&[blob, &context.to_bytes()]),
        )
    }

    /// Decrypt a handle on behalf of `principal`, enforcing the ACL.
    pub fn decrypt(&self, handle: CtHandle, principal: Principal) -> Result<u64, CipherError> {
        let value = self
            .values
            .get(&handle)
            .copied()
            .ok_or(CipherError::UnknownHandle)?;
        let granted = self
            .acl
            .get(&handle)
            .map(|set| set.contains(&principal))
            .unwrap_or(false);
        if !granted {
            return Err(CipherError::AccessDenied);
        }
        Ok(value)
    }

    /// Principals currently holding decrypt rights on a handle.
    pub fn grants(&self, handle: CtHandle) -> Vec<Principal> {
        self.acl
            .get(&handle)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn next_handle(&mut self) -> Hash {
        let h = hash_concat(&[&self.seed, &self.counter.to_le_bytes()]);
        self.counter += 1;
        h
    }

    fn store(&mut self, value: u64) -> CtHandle {
        let handle = CtHandle(self.next_handle());
        self.values.insert(handle, value);
        handle
    }
}

impl Default for PlainEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CiphertextOps for PlainEngine {
    fn from_external(
        &mut self,
        blob: &[u8],
        proof: &[u8],
        context: &EncryptionContext,
    ) -> Result<CtHandle, CipherError> {
        let expected = Self::prove(blob, context);
        if !crate::constant_time_eq(proof, &expected) {
            return Err(CipherError::ProofInvalid);
        }
        if blob.len() != 8 {
            return Err(CipherError::ProofInvalid);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(blob);
        Ok(self.store(u64::from_le_bytes(raw)))
    }

    fn encrypt(&mut self, value: u64, _context: &EncryptionContext) -> CtHandle {
        self.store(value)
    }

    fn add(&mut self, a: CtHandle, b: CtHandle) -> Result<CtHandle, CipherError> {
        let va = *self.values.get(&a).ok_or(CipherError::UnknownHandle)?;
        let vb = *self.values.get(&b).ok_or(CipherError::UnknownHandle)?;
        Ok(self.store(va.wrapping_add(vb)))
    }

    fn sub(&mut self, a: CtHandle, b: CtHandle) -> Result<CtHandle, CipherError> {
        let va = *self.values.get(&a).ok_or(CipherError::UnknownHandle)?;
        let vb = *self.values.get(&b).ok_or(CipherError::UnknownHandle)?;
        Ok(self.store(va.wrapping_sub(vb)))
    }

    fn ge(&mut self, a: CtHandle, b: CtHandle) -> Result<BoolHandle, CipherError> {
        let va = *self.values.get(&a).ok_or(CipherError::UnknownHandle)?;
        let vb = *self.values.get(&b).ok_or(CipherError::UnknownHandle)?;
        let handle = BoolHandle(self.next_handle());
        self.bools.insert(handle, va >= vb);
        Ok(handle)
    }

    fn select(
        &mut self,
        cond: BoolHandle,
        if_true: CtHandle,
        if_false: CtHandle,
    ) -> Result<CtHandle, CipherError> {
        let c = *self.bools.get(&cond).ok_or(CipherError::UnknownHandle)?;
        let vt = *self
            .values
            .get(&if_true)
            .ok_or(CipherError::UnknownHandle)?;
        let vf = *self
            .values
            .get(&if_false)
            .ok_or(CipherError::UnknownHandle)?;
        // Arithmetic selection rather than `if`, mirroring what a
        // homomorphic backend computes: c*t + (1-c)*f.
        let c = c as u64;
        Ok(self.store(c.wrapping_mul(vt).wrapping_add((1 - c).wrapping_mul(vf))))
    }

    fn is_initialized(&self, handle: CtHandle) -> bool {
        self.values.contains_key(&handle)
    }

    fn allow(&mut self, handle: CtHandle, principal: Principal) -> Result<(), CipherError> {
        if !self.values.contains_key(&handle) {
            return Err(CipherError::UnknownHandle);
        }
        self.acl.entry(handle).or_default().insert(principal);
        Ok(())
    }
}
