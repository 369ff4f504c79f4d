//! Confidential ledger: encrypted per-account balances with two-phase
//! withdrawal settlement.
//!
//! Balances are ciphertext handles, lazily created on first credit and never
//! destroyed. Conditional effects are branchless: a transfer computes
//! `ok = ge(balance, amount)` and moves `select(ok, amount, 0)`, so an
//! insufficient balance silently moves zero value instead of reverting.
//! Execution therefore never branches on a secret comparison; callers learn
//! success only by decrypting their own balance afterwards. Total value is
//! conserved either way.
//!
//! Withdrawals settle in two phases. Phase 1 (synchronous) debits the
//! branchless `actual`, appends a [`WithdrawRequest`], grants the oracle
//! decrypt rights on `actual`, and records the oracle's correlation id.
//! Phase 2 ([`ConfidentialLedger::withdraw_callback`]) consumes the oracle's
//! signed plaintext at most once per correlation id and releases the funds
//! from the settlement pool to the owner's external balance. A request whose
//! callback never arrives stays debited and unpaid; the protocol defines no
//! timeout or retry, a known trust-model gap carried over deliberately.
//!
//! Every balance mutation re-issues decrypt grants to {owner, Ledger}, since
//! grants never carry over to freshly produced handles.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::cipher::{CiphertextOps, CtHandle, EncryptionContext, Principal};
use crate::oracle::{DecryptionOracle, OracleCallback, SignerSet};
use crate::{constants, Address};

/// Errors from ledger operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount {amount} outside allowed range [{min}, {max}]")]
    AmountOutOfBounds { amount: u64, min: u64, max: u64 },
    #[error("settlement pool would overflow")]
    PoolOverflow,
    #[error("oracle callback signatures failed verification")]
    SignatureInvalid,
    #[error("correlation id {0} was already settled")]
    AlreadyProcessed(u64),
    #[error("unknown correlation id {0}")]
    NotFound(u64),
    #[error("settlement pool holds {available}, cannot pay out {needed}")]
    NotYetEligible { needed: u64, available: u64 },
    #[error("cipher failure: {0}")]
    Cipher(#[from] crate::cipher::CipherError),
}

/// One withdrawal awaiting (or past) settlement. Append-only; `processed`
/// flips false→true exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: u64,
    pub owner: Address,
    pub amount: CtHandle,
    pub timestamp: u64,
    pub processed: bool,
}

/// Encrypted balances, withdrawal log, correlation map, and settlement pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfidentialLedger {
    /// Contract identity bound into internally produced ciphertexts.
    contract: Address,
    min_withdraw: u64,
    max_withdraw: u64,
    /// Encrypted balance per account. Absent means never initialized.
    balances: HashMap<Address, CtHandle>,
    /// Append-only withdrawal log; a request's id is its index.
    requests: Vec<WithdrawRequest>,
    /// Outstanding decryption requests: correlation id -> request id.
    /// Entries are deleted when their callback commits, bounding storage.
    correlations: HashMap<u64, u64>,
    /// Correlation ids already settled, so a replay reports
    /// `AlreadyProcessed` rather than `NotFound`.
    consumed: HashSet<u64>,
    /// Plaintext value held for settlement (deposits in, payouts out).
    pool: u64,
    /// Settled external balances per account.
    external: HashMap<Address, u64>,
}

impl ConfidentialLedger {
    /// Create a ledger bound to a contract identity with the given
    /// withdrawal bounds.
    pub fn new(contract: Address, min_withdraw: u64, max_withdraw: u64) -> Self {
        ConfidentialLedger {
            contract,
            min_withdraw,
            max_withdraw,
            balances: HashMap::new(),
            requests: Vec::new(),
            correlations: HashMap::new(),
            consumed: HashSet::new(),
            pool: 0,
            external: HashMap::new(),
        }
    }

    /// Create a ledger with the protocol default withdrawal bounds.
    pub fn with_defaults(contract: Address) -> Self {
        Self::new(contract, constants::MIN_WITHDRAW, constants::MAX_WITHDRAW)
    }

    /// Credit a plaintext deposit to an account's encrypted balance and add
    /// the value to the settlement pool.
    pub fn deposit<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        account: Address,
        amount: u64,
    ) -> Result<(), LedgerError> {
        if amount < self.min_withdraw || amount > self.max_withdraw {
            return Err(LedgerError::AmountOutOfBounds {
                amount,
                min: self.min_withdraw,
                max: self.max_withdraw,
            });
        }
        let pool = self
            .pool
            .checked_add(amount)
            .ok_or(LedgerError::PoolOverflow)?;

        let enc = ops.encrypt(amount, &self.context_for(account));
        self.credit(ops, account, enc)?;
        self.pool = pool;
        tracing::debug!(%account, amount, "deposit credited");
        Ok(())
    }

    /// Move up to `amount` from `from` to `to`, branchlessly.
    ///
    /// Never fails on insufficient balance: `actual` is zero then, and both
    /// balances are re-encrypted regardless, so the comparison outcome is
    /// not observable from control flow or state shape.
    pub fn transfer<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        from: Address,
        to: Address,
        amount: CtHandle,
    ) -> Result<(), LedgerError> {
        let actual = self.debit_up_to(ops, from, amount)?;
        self.credit(ops, to, actual)?;
        Ok(())
    }

    /// Phase 1 of a withdrawal: branchless debit, request logging, and the
    /// decryption request. Returns the new request's id.
    pub fn withdraw<C: CiphertextOps, O: DecryptionOracle>(
        &mut self,
        ops: &mut C,
        oracle: &mut O,
        account: Address,
        amount: CtHandle,
        now: u64,
    ) -> Result<u64, LedgerError> {
        let actual = self.debit_up_to(ops, account, amount)?;
        ops.allow(actual, Principal::Oracle)?;
        ops.allow(actual, Principal::Account(account))?;

        let id = self.requests.len() as u64;
        self.requests.push(WithdrawRequest {
            id,
            owner: account,
            amount: actual,
            timestamp: now,
            processed: false,
        });
        let correlation_id = oracle.request_decryption(&[actual]);
        self.correlations.insert(correlation_id, id);
        tracing::debug!(%account, request = id, correlation_id, "withdrawal requested");
        Ok(id)
    }

    /// Phase 2 of a withdrawal: consume the oracle's signed plaintext.
    ///
    /// All-or-nothing: any failed check leaves the request exactly as
    /// Phase 1 wrote it (the correlation entry survives, so a later retry
    /// of the same callback may still settle, e.g. after the pool is
    /// replenished). Each correlation id settles at most once; a replay is
    /// rejected with [`LedgerError::AlreadyProcessed`], the primary
    /// double-payout guard.
    pub fn withdraw_callback(
        &mut self,
        callback: &OracleCallback,
        signers: &SignerSet,
    ) -> Result<(), LedgerError> {
        if !signers.verify(callback) {
            tracing::warn!(
                correlation_id = callback.correlation_id,
                "withdrawal callback failed signature verification"
            );
            return Err(LedgerError::SignatureInvalid);
        }

        let correlation_id = callback.correlation_id;
        if self.consumed.contains(&correlation_id) {
            return Err(LedgerError::AlreadyProcessed(correlation_id));
        }
        let request_id = *self
            .correlations
            .get(&correlation_id)
            .ok_or(LedgerError::NotFound(correlation_id))?;
        // The log is append-only and correlation entries are written right
        // after the push, so the index is always in range.
        let request = &self.requests[request_id as usize];
        if request.processed {
            return Err(LedgerError::AlreadyProcessed(correlation_id));
        }

        let amount = callback.plaintext;
        if amount < self.min_withdraw || amount > self.max_withdraw {
            return Err(LedgerError::AmountOutOfBounds {
                amount,
                min: self.min_withdraw,
                max: self.max_withdraw,
            });
        }
        if self.pool < amount {
            return Err(LedgerError::NotYetEligible {
                needed: amount,
                available: self.pool,
            });
        }

        // Commit point: all checks passed.
        let owner = request.owner;
        self.requests[request_id as usize].processed = true;
        self.correlations.remove(&correlation_id);
        self.consumed.insert(correlation_id);
        self.pool -= amount;
        *self.external.entry(owner).or_insert(0) += amount;
        tracing::info!(%owner, request = request_id, amount, "withdrawal settled");
        Ok(())
    }

    /// Debit up to `amount` from an account, returning the encrypted
    /// `actual` that was moved (`amount` if covered, zero otherwise).
    ///
    /// Shared with the red-packet engine. An account that never held a
    /// balance is materialized as encrypted zero first so the branchless
    /// formula applies uniformly.
    pub fn debit_up_to<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        account: Address,
        amount: CtHandle,
    ) -> Result<CtHandle, LedgerError> {
        let balance = match self.balances.get(&account) {
            Some(&b) if ops.is_initialized(b) => b,
            _ => ops.encrypt(0, &self.context_for(account)),
        };
        let ok = ops.ge(balance, amount)?;
        let zero = ops.encrypt(0, &self.context_for(account));
        let actual = ops.select(ok, amount, zero)?;
        let updated = ops.sub(balance, actual)?;
        self.set_balance(ops, account, updated)?;
        Ok(actual)
    }

    /// Credit an encrypted amount to an account, initializing the balance
    /// if absent. Shared with the red-packet engine.
    pub fn credit<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        account: Address,
        amount: CtHandle,
    ) -> Result<(), LedgerError> {
        let updated = match self.balances.get(&account) {
            Some(&b) if ops.is_initialized(b) => ops.add(b, amount)?,
            _ => amount,
        };
        self.set_balance(ops, account, updated)
    }

    /// The account's current encrypted balance handle, if initialized.
    pub fn balance_handle(&self, account: Address) -> Option<CtHandle> {
        self.balances.get(&account).copied()
    }

    /// The account's settled external balance.
    pub fn external_balance(&self, account: Address) -> u64 {
        self.external.get(&account).copied().unwrap_or(0)
    }

    /// Plaintext value currently held for settlement.
    pub fn pool_total(&self) -> u64 {
        self.pool
    }

    /// Ids of all withdrawal requests an account ever made.
    pub fn user_withdraw_requests(&self, account: Address) -> Vec<u64> {
        self.requests
            .iter()
            .filter(|r| r.owner == account)
            .map(|r| r.id)
            .collect()
    }

    /// Look up a withdrawal request by id.
    pub fn withdraw_request(&self, id: u64) -> Option<&WithdrawRequest> {
        self.requests.get(id as usize)
    }

    /// Number of correlation entries still awaiting their callback.
    pub fn outstanding_settlements(&self) -> usize {
        self.correlations.len()
    }

    fn context_for(&self, account: Address) -> EncryptionContext {
        EncryptionContext {
            contract: self.contract,
            sender: account,
        }
    }

    /// Store a new balance handle and re-issue decrypt grants: the owner
    /// must always be able to decrypt their own latest balance, and the
    /// ledger must keep operating on it.
    fn set_balance<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        account: Address,
        handle: CtHandle,
    ) -> Result<(), LedgerError> {
        ops.allow(handle, Principal::Account(account))?;
        ops.allow(handle, Principal::Ledger)?;
        self.balances.insert(account, handle);
        Ok(())
    }
}
