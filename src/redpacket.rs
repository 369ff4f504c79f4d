//! Red packets: time-bound conditional value transfer.
//!
//! A red packet escrows an encrypted amount from the sender toward one
//! recipient. Within the claim window (7 days by default) only the recipient
//! may claim it; after expiry only the sender may reclaim it. The `claimed`
//! flag is the single state discriminator and flips false→true exactly once,
//! so a packet settles through claim or reclaim but never both.
//!
//! Creation debits the sender through the ledger's branchless primitive: an
//! under-funded sender still produces a valid packet, it just escrows zero;
//! claimable, decrypting to nothing. This mirrors the transfer trade-off of
//! never branching on a secret comparison.

use serde::{Deserialize, Serialize};

use crate::cipher::{CiphertextOps, CtHandle, Principal};
use crate::ledger::ConfidentialLedger;
use crate::{constants, Address};

/// Errors from red-packet operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PacketError {
    #[error("cannot send a red packet to yourself")]
    SelfSend,
    #[error("unknown red packet id {0}")]
    NotFound(u64),
    #[error("red packet {0} was already claimed or reclaimed")]
    AlreadyProcessed(u64),
    #[error("red packet expired at {expire_time}, now {now}")]
    Expired { expire_time: u64, now: u64 },
    #[error("red packet not reclaimable until after {expire_time}, now {now}")]
    NotYetExpired { expire_time: u64, now: u64 },
    #[error("caller is neither this packet's sender nor recipient")]
    AccessDenied,
    #[error("ledger failure: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error("cipher failure: {0}")]
    Cipher(#[from] crate::cipher::CipherError),
}

/// One red packet. Append-only; `claimed` flips exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedPacket {
    pub id: u64,
    pub sender: Address,
    pub recipient: Address,
    pub amount: CtHandle,
    pub expire_time: u64,
    pub claimed: bool,
}

/// The red-packet log and its claim window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedPacketEngine {
    lifetime_secs: u64,
    packets: Vec<RedPacket>,
}

impl RedPacketEngine {
    /// Create an engine with the given claim window.
    pub fn new(lifetime_secs: u64) -> Self {
        RedPacketEngine {
            lifetime_secs,
            packets: Vec::new(),
        }
    }

    /// Create an engine with the protocol default 7-day window.
    pub fn with_defaults() -> Self {
        Self::new(constants::RED_PACKET_LIFETIME_SECS)
    }

    /// Escrow a packet from `sender` toward `recipient`.
    ///
    /// The debit is branchless: an under-funded sender escrows encrypted
    /// zero rather than failing. Both parties receive decrypt rights on the
    /// escrowed amount. Returns the packet id.
    pub fn create<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        ledger: &mut ConfidentialLedger,
        sender: Address,
        recipient: Address,
        amount: CtHandle,
        now: u64,
    ) -> Result<u64, PacketError> {
        if sender == recipient {
            return Err(PacketError::SelfSend);
        }
        let actual = ledger.debit_up_to(ops, sender, amount)?;
        ops.allow(actual, Principal::Account(sender))?;
        ops.allow(actual, Principal::Account(recipient))?;

        let id = self.packets.len() as u64;
        self.packets.push(RedPacket {
            id,
            sender,
            recipient,
            amount: actual,
            expire_time: now + self.lifetime_secs,
            claimed: false,
        });
        tracing::debug!(id, %sender, %recipient, "red packet created");
        Ok(id)
    }

    /// Claim a packet before expiry. Recipient only; flips `claimed` and
    /// credits the escrowed amount to the recipient.
    pub fn claim<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        ledger: &mut ConfidentialLedger,
        caller: Address,
        id: u64,
        now: u64,
    ) -> Result<(), PacketError> {
        let packet = self
            .packets
            .get(id as usize)
            .ok_or(PacketError::NotFound(id))?;
        if caller != packet.recipient {
            return Err(PacketError::AccessDenied);
        }
        if packet.claimed {
            return Err(PacketError::AlreadyProcessed(id));
        }
        if now > packet.expire_time {
            return Err(PacketError::Expired {
                expire_time: packet.expire_time,
                now,
            });
        }
        let amount = packet.amount;
        ledger.credit(ops, caller, amount)?;
        self.packets[id as usize].claimed = true;
        tracing::debug!(id, recipient = %caller, "red packet claimed");
        Ok(())
    }

    /// Reclaim an expired, unclaimed packet. Sender only; flips `claimed`
    /// and returns the escrowed amount to the sender.
    pub fn reclaim<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        ledger: &mut ConfidentialLedger,
        caller: Address,
        id: u64,
        now: u64,
    ) -> Result<(), PacketError> {
        let packet = self
            .packets
            .get(id as usize)
            .ok_or(PacketError::NotFound(id))?;
        if caller != packet.sender {
            return Err(PacketError::AccessDenied);
        }
        if packet.claimed {
            return Err(PacketError::AlreadyProcessed(id));
        }
        if now <= packet.expire_time {
            return Err(PacketError::NotYetExpired {
                expire_time: packet.expire_time,
                now,
            });
        }
        let amount = packet.amount;
        ledger.credit(ops, caller, amount)?;
        self.packets[id as usize].claimed = true;
        tracing::debug!(id, sender = %caller, "red packet reclaimed");
        Ok(())
    }

    /// Look up a packet by id.
    pub fn get(&self, id: u64) -> Option<&RedPacket> {
        self.packets.get(id as usize)
    }

    /// The escrowed amount handle, visible to the packet's sender and
    /// recipient only.
    pub fn amount_handle(&self, id: u64, caller: Address) -> Result<CtHandle, PacketError> {
        let packet = self
            .packets
            .get(id as usize)
            .ok_or(PacketError::NotFound(id))?;
        if caller != packet.sender && caller != packet.recipient {
            return Err(PacketError::AccessDenied);
        }
        Ok(packet.amount)
    }

    /// Total packets ever created.
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}

impl Default for RedPacketEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}
