//! Service facade: the protocol core wired together.
//!
//! [`Service`] owns the cipher capability, the oracle boundary, and the
//! three engines, and exposes the surface an embedder (wallet backend, RPC
//! layer) drives: text send/query, ledger mutations, red-packet lifecycle,
//! and serde DTOs for reporting. Every mutating method takes `&mut self`, so
//! operations are serialized by construction; the all-or-nothing semantics
//! of each engine carry through unchanged.
//!
//! Chunk encryption is deduplicated through the bounded [`EncryptCache`]:
//! identical plaintext chunks from the same sender within the TTL reuse the
//! previously produced ciphertext handle.

use serde::{Deserialize, Serialize};

use crate::cipher::{CiphertextOps, CtHandle, EncryptionContext, PlainEngine};
use crate::codec::{self, CacheKey, EncryptCache};
use crate::config::CachetConfig;
use crate::ledger::ConfidentialLedger;
use crate::messages::MessageStore;
use crate::oracle::{DecryptionOracle, LocalOracle, OracleCallback, OracleError, SignerSet};
use crate::redpacket::RedPacketEngine;
use crate::{constants, Address};

/// Errors surfaced by the service facade.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("message error: {0}")]
    Message(#[from] crate::messages::MessageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error("red packet error: {0}")]
    Packet(#[from] crate::redpacket::PacketError),
    #[error("cipher error: {0}")]
    Cipher(#[from] crate::cipher::CipherError),
}

/// Which slice of a user's messages to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Every message, newest first.
    All,
    /// The default number of most recent messages.
    Latest,
    /// A caller-chosen number of most recent messages (1..=100).
    LatestCustom(usize),
}

/// Plaintext metadata of one message (content stays encrypted).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: u32,
    pub sender: Address,
    pub recipient: Address,
    pub chunk_count: usize,
    pub timestamp: u64,
    pub is_read: bool,
}

/// Plaintext metadata of one withdrawal request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawRequestInfo {
    pub id: u64,
    pub owner: Address,
    pub timestamp: u64,
    pub processed: bool,
}

/// Plaintext metadata of one red packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedPacketInfo {
    pub id: u64,
    pub sender: Address,
    pub recipient: Address,
    pub expire_time: u64,
    pub claimed: bool,
}

/// Serializable protocol state, for [`crate::storage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub messages: MessageStore,
    pub ledger: ConfidentialLedger,
    pub packets: RedPacketEngine,
    pub cache: EncryptCache,
}

/// The protocol core: cipher + oracle + engines behind one mutation point.
pub struct Service<C: CiphertextOps, O: DecryptionOracle> {
    contract: Address,
    cipher: C,
    oracle: O,
    signers: SignerSet,
    cache: EncryptCache,
    messages: MessageStore,
    ledger: ConfidentialLedger,
    packets: RedPacketEngine,
}

impl<C: CiphertextOps, O: DecryptionOracle> Service<C, O> {
    /// Wire up a fresh service from configuration.
    pub fn new(
        config: &CachetConfig,
        contract: Address,
        cipher: C,
        oracle: O,
        signers: SignerSet,
    ) -> Self {
        Service {
            contract,
            cipher,
            oracle,
            signers,
            cache: EncryptCache::new(config.codec.cache_ttl_secs, config.codec.cache_capacity),
            messages: MessageStore::new(),
            ledger: ConfidentialLedger::new(
                contract,
                config.ledger.min_withdraw,
                config.ledger.max_withdraw,
            ),
            packets: RedPacketEngine::new(config.redpacket.lifetime_secs),
        }
    }

    /// Rebuild a service around previously persisted protocol state.
    pub fn from_snapshot(
        snapshot: ServiceSnapshot,
        contract: Address,
        cipher: C,
        oracle: O,
        signers: SignerSet,
    ) -> Self {
        Service {
            contract,
            cipher,
            oracle,
            signers,
            cache: snapshot.cache,
            messages: snapshot.messages,
            ledger: snapshot.ledger,
            packets: snapshot.packets,
        }
    }

    /// Export the protocol state for persistence.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            messages: self.messages.clone(),
            ledger: self.ledger.clone(),
            packets: self.packets.clone(),
            cache: self.cache.clone(),
        }
    }

    // ── Messaging ──

    /// Encode, encrypt (with dedup), and store a text message. Returns the
    /// new message id.
    pub fn send_text(
        &mut self,
        sender: Address,
        recipient: Address,
        text: &str,
        now: u64,
    ) -> Result<u32, ServiceError> {
        let context = EncryptionContext {
            contract: self.contract,
            sender,
        };
        let mut handles = Vec::new();
        for chunk in codec::encode(text)? {
            let key = CacheKey { chunk, context };
            let handle = match self.cache.get(&key, now) {
                Some(handle) => handle,
                None => {
                    let handle = self.cipher.encrypt(chunk, &context);
                    self.cache.insert(key, handle, now);
                    handle
                }
            };
            handles.push(handle);
        }
        let id = self
            .messages
            .send(&mut self.cipher, sender, recipient, handles, now)?;
        Ok(id)
    }

    /// Flip a message's read flag (recipient only, idempotent).
    pub fn mark_read(&mut self, id: u32, caller: Address) -> Result<(), ServiceError> {
        self.messages.mark_read(id, caller)?;
        Ok(())
    }

    /// Report a user's messages per the query kind, newest first.
    pub fn query_messages(
        &self,
        user: Address,
        kind: QueryKind,
    ) -> Result<Vec<MessageSummary>, ServiceError> {
        let ids = match kind {
            QueryKind::All => self.messages.get_all(user, user)?,
            QueryKind::Latest => {
                self.messages
                    .get_latest(user, user, constants::DEFAULT_LATEST_LIMIT)?
            }
            QueryKind::LatestCustom(limit) => self.messages.get_latest(user, user, limit)?,
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| self.messages.message(id))
            .map(|m| MessageSummary {
                id: m.id,
                sender: m.sender,
                recipient: m.recipient,
                chunk_count: m.chunks.len(),
                timestamp: m.timestamp,
                is_read: m.is_read,
            })
            .collect())
    }

    /// All chunk handles of a message, for a caller holding a grant.
    pub fn get_message_handles(
        &self,
        id: u32,
        caller: Address,
    ) -> Result<Vec<CtHandle>, ServiceError> {
        Ok(self.messages.get_message_handles(&self.cipher, id, caller)?)
    }

    /// One chunk handle of a message, for a caller holding a grant.
    pub fn get_message_chunk(
        &self,
        id: u32,
        index: usize,
        caller: Address,
    ) -> Result<CtHandle, ServiceError> {
        Ok(self
            .messages
            .get_message_chunk(&self.cipher, id, index, caller)?)
    }

    // ── Ledger ──

    /// Import an externally encrypted amount bound to `sender`.
    pub fn import_amount(
        &mut self,
        sender: Address,
        blob: &[u8],
        proof: &[u8],
    ) -> Result<CtHandle, ServiceError> {
        let context = EncryptionContext {
            contract: self.contract,
            sender,
        };
        Ok(self.cipher.from_external(blob, proof, &context)?)
    }

    /// Credit a plaintext deposit.
    pub fn deposit(&mut self, account: Address, amount: u64) -> Result<(), ServiceError> {
        self.ledger.deposit(&mut self.cipher, account, amount)?;
        Ok(())
    }

    /// Branchless encrypted transfer.
    pub fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: CtHandle,
    ) -> Result<(), ServiceError> {
        self.ledger.transfer(&mut self.cipher, from, to, amount)?;
        Ok(())
    }

    /// Phase 1 of a withdrawal. Returns the request id.
    pub fn withdraw(
        &mut self,
        account: Address,
        amount: CtHandle,
        now: u64,
    ) -> Result<u64, ServiceError> {
        Ok(self
            .ledger
            .withdraw(&mut self.cipher, &mut self.oracle, account, amount, now)?)
    }

    /// Phase 2 of a withdrawal: consume an oracle callback.
    pub fn withdraw_callback(&mut self, callback: &OracleCallback) -> Result<(), ServiceError> {
        self.ledger.withdraw_callback(callback, &self.signers)?;
        Ok(())
    }

    /// The account's encrypted balance handle, if initialized.
    pub fn get_balance_handle(&self, account: Address) -> Option<CtHandle> {
        self.ledger.balance_handle(account)
    }

    /// The account's settled external balance.
    pub fn external_balance(&self, account: Address) -> u64 {
        self.ledger.external_balance(account)
    }

    /// Ids of all withdrawal requests an account ever made.
    pub fn get_user_withdraw_requests(&self, account: Address) -> Vec<u64> {
        self.ledger.user_withdraw_requests(account)
    }

    /// Metadata of one withdrawal request.
    pub fn get_withdraw_request(&self, id: u64) -> Option<WithdrawRequestInfo> {
        self.ledger.withdraw_request(id).map(|r| WithdrawRequestInfo {
            id: r.id,
            owner: r.owner,
            timestamp: r.timestamp,
            processed: r.processed,
        })
    }

    // ── Red packets ──

    /// Escrow a red packet. Returns the packet id.
    pub fn create_red_packet(
        &mut self,
        sender: Address,
        recipient: Address,
        amount: CtHandle,
        now: u64,
    ) -> Result<u64, ServiceError> {
        Ok(self.packets.create(
            &mut self.cipher,
            &mut self.ledger,
            sender,
            recipient,
            amount,
            now,
        )?)
    }

    /// Claim a red packet (recipient, before expiry).
    pub fn claim_red_packet(
        &mut self,
        caller: Address,
        id: u64,
        now: u64,
    ) -> Result<(), ServiceError> {
        self.packets
            .claim(&mut self.cipher, &mut self.ledger, caller, id, now)?;
        Ok(())
    }

    /// Reclaim an expired red packet (sender, after expiry).
    pub fn reclaim_red_packet(
        &mut self,
        caller: Address,
        id: u64,
        now: u64,
    ) -> Result<(), ServiceError> {
        self.packets
            .reclaim(&mut self.cipher, &mut self.ledger, caller, id, now)?;
        Ok(())
    }

    /// Metadata of one red packet.
    pub fn get_red_packet(&self, id: u64) -> Option<RedPacketInfo> {
        self.packets.get(id).map(|p| RedPacketInfo {
            id: p.id,
            sender: p.sender,
            recipient: p.recipient,
            expire_time: p.expire_time,
            claimed: p.claimed,
        })
    }

    /// The packet's escrowed amount handle (sender or recipient only).
    pub fn get_red_packet_amount_handle(
        &self,
        id: u64,
        caller: Address,
    ) -> Result<CtHandle, ServiceError> {
        Ok(self.packets.amount_handle(id, caller)?)
    }

    // ── Introspection ──

    /// The cipher backend (read-only; decryption paths live here for the
    /// plaintext engine).
    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    /// The contract identity ciphertexts are bound to.
    pub fn contract(&self) -> Address {
        self.contract
    }
}

impl Service<PlainEngine, LocalOracle> {
    /// Convenience constructor for the fully in-process stack: plaintext
    /// cipher engine and a single-signer local oracle.
    pub fn in_process(config: &CachetConfig, contract: Address) -> Self {
        let oracle = LocalOracle::single();
        let signers = oracle.signer_set(config.oracle.signer_threshold);
        Self::new(config, contract, PlainEngine::new(), oracle, signers)
    }

    /// Correlation ids the local oracle has not yet fulfilled.
    pub fn oracle_pending_ids(&self) -> Vec<u64> {
        self.oracle.pending_ids()
    }

    /// Drive the local oracle: decrypt a pending request and produce the
    /// signed callback (which the caller then feeds to
    /// [`Service::withdraw_callback`], mirroring the out-of-band hop a real
    /// oracle network makes).
    pub fn fulfill_decryption(
        &mut self,
        correlation_id: u64,
    ) -> Result<OracleCallback, OracleError> {
        self.oracle.fulfill(correlation_id, &self.cipher)
    }
}
