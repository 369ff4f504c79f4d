//! Append-only message log with a paginated per-user index.
//!
//! Every sent message lands in one global log and its id is appended to both
//! parties' page indexes. A page holds up to 50 ids in insertion order; a new
//! page opens when the current one is full or absent, and pages are never
//! compacted. Access grants (which address may request decryption of a
//! message's chunks) are written exactly once at send time for {sender,
//! recipient} and never revoked (an intentional trust-model choice carried
//! from the protocol, not an oversight to patch).
//!
//! Queries return ids newest-first. `get_range` is a linear scan filtered by
//! access grant; it is O(range) by design, acceptable for the bounded ranges
//! clients request.
//!
//! All mutation goes through `&mut self`, so message sends and read flips are
//! serialized by construction and either apply in full or not at all.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::cipher::{CiphertextOps, CtHandle, Principal};
use crate::{constants, Address};

/// Errors from message-store operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message must carry between 1 and {} chunks, got {}", constants::MAX_CHUNKS, .0)]
    ChunkCountOutOfRange(usize),
    #[error("query limit must be between 1 and {}, got {}", constants::MAX_QUERY_LIMIT, .0)]
    LimitOutOfRange(usize),
    #[error("invalid id range: start {start}, end {end}, max {max}")]
    BadRange { start: u32, end: u32, max: u32 },
    #[error("unknown message id {0}")]
    NotFound(u32),
    #[error("chunk index {index} out of range for message with {count} chunks")]
    ChunkIndexOutOfRange { index: usize, count: usize },
    #[error("message chunk is not an initialized ciphertext")]
    ChunkUninitialized,
    #[error("caller holds no access to this message or index")]
    AccessDenied,
    #[error("cipher failure: {0}")]
    Cipher(#[from] crate::cipher::CipherError),
}

/// One entry in the message log. Created once at send; only `is_read`
/// mutates afterwards, and only from false to true.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: u32,
    pub sender: Address,
    pub recipient: Address,
    pub chunks: Vec<CtHandle>,
    pub timestamp: u64,
    pub is_read: bool,
}

/// Per-user activity counters. Monotone.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub sent_count: u64,
    pub received_count: u64,
    pub last_activity: u64,
}

/// Fixed-capacity bucket of message ids in insertion order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Page {
    ids: Vec<u32>,
}

/// The message log, per-user page index, grant set, and stats.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageStore {
    /// Global append-only log; a message's id is its index.
    messages: Vec<Message>,
    /// Per-user ordered pages of message ids.
    pages: HashMap<Address, Vec<Page>>,
    /// (message id, address) pairs allowed to request chunk decryption.
    grants: HashSet<(u32, Address)>,
    /// Per-user counters.
    stats: HashMap<Address, UserStats>,
}

impl MessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, index it for both parties, and grant both decrypt
    /// rights on every chunk.
    ///
    /// Self-sends are permitted; the sender's index then receives the id
    /// twice (once per role), matching the append-per-role contract.
    pub fn send<C: CiphertextOps>(
        &mut self,
        ops: &mut C,
        sender: Address,
        recipient: Address,
        chunks: Vec<CtHandle>,
        now: u64,
    ) -> Result<u32, MessageError> {
        if chunks.is_empty() || chunks.len() > constants::MAX_CHUNKS {
            return Err(MessageError::ChunkCountOutOfRange(chunks.len()));
        }
        let id = self.messages.len() as u32;

        for &chunk in &chunks {
            ops.allow(chunk, Principal::Account(sender))?;
            ops.allow(chunk, Principal::Account(recipient))?;
        }

        self.messages.push(Message {
            id,
            sender,
            recipient,
            chunks,
            timestamp: now,
            is_read: false,
        });
        self.append_to_index(sender, id);
        self.append_to_index(recipient, id);
        self.grants.insert((id, sender));
        self.grants.insert((id, recipient));

        let s = self.stats.entry(sender).or_default();
        s.sent_count += 1;
        s.last_activity = now;
        let r = self.stats.entry(recipient).or_default();
        r.received_count += 1;
        r.last_activity = now;

        tracing::debug!(id, %sender, %recipient, "message stored");
        Ok(id)
    }

    /// Flip a message's read flag. Only the recipient may do so; repeated
    /// calls are no-ops, not errors.
    pub fn mark_read(&mut self, id: u32, caller: Address) -> Result<(), MessageError> {
        let msg = self
            .messages
            .get_mut(id as usize)
            .ok_or(MessageError::NotFound(id))?;
        if caller != msg.recipient {
            return Err(MessageError::AccessDenied);
        }
        msg.is_read = true;
        Ok(())
    }

    /// All of a user's message ids, newest id first. The caller must own
    /// the index being read.
    pub fn get_all(&self, user: Address, caller: Address) -> Result<Vec<u32>, MessageError> {
        if caller != user {
            return Err(MessageError::AccessDenied);
        }
        let mut ids: Vec<u32> = self
            .pages
            .get(&user)
            .map(|pages| pages.iter().flat_map(|p| p.ids.iter().copied()).collect())
            .unwrap_or_default();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// The user's most recent message ids, newest first.
    ///
    /// Walks pages newest to oldest and entries last-inserted first,
    /// collecting `min(limit, total)` ids. `limit` must be in
    /// `1..=MAX_QUERY_LIMIT`.
    pub fn get_latest(
        &self,
        user: Address,
        caller: Address,
        limit: usize,
    ) -> Result<Vec<u32>, MessageError> {
        if caller != user {
            return Err(MessageError::AccessDenied);
        }
        if limit == 0 || limit > constants::MAX_QUERY_LIMIT {
            return Err(MessageError::LimitOutOfRange(limit));
        }
        let mut ids = Vec::with_capacity(limit);
        if let Some(pages) = self.pages.get(&user) {
            'outer: for page in pages.iter().rev() {
                for &id in page.ids.iter().rev() {
                    ids.push(id);
                    if ids.len() == limit {
                        break 'outer;
                    }
                }
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Every id in `[start, end]` the user holds an access grant for.
    ///
    /// Linear in the range size; requires `start <= end <= max id`.
    pub fn get_range(
        &self,
        user: Address,
        caller: Address,
        start: u32,
        end: u32,
    ) -> Result<Vec<u32>, MessageError> {
        if caller != user {
            return Err(MessageError::AccessDenied);
        }
        let max = match self.messages.len() {
            0 => {
                return Err(MessageError::BadRange {
                    start,
                    end,
                    max: 0,
                })
            }
            n => (n - 1) as u32,
        };
        if start > end || end > max {
            return Err(MessageError::BadRange { start, end, max });
        }
        Ok((start..=end)
            .filter(|&id| self.grants.contains(&(id, user)))
            .collect())
    }

    /// All chunk handles of a message, for a caller holding an access grant.
    pub fn get_message_handles<C: CiphertextOps>(
        &self,
        ops: &C,
        id: u32,
        caller: Address,
    ) -> Result<Vec<CtHandle>, MessageError> {
        let msg = self.granted_message(id, caller)?;
        if !msg.chunks.iter().all(|&h| ops.is_initialized(h)) {
            return Err(MessageError::ChunkUninitialized);
        }
        Ok(msg.chunks.clone())
    }

    /// One chunk handle of a message, for a caller holding an access grant.
    pub fn get_message_chunk<C: CiphertextOps>(
        &self,
        ops: &C,
        id: u32,
        index: usize,
        caller: Address,
    ) -> Result<CtHandle, MessageError> {
        let msg = self.granted_message(id, caller)?;
        let &handle = msg
            .chunks
            .get(index)
            .ok_or(MessageError::ChunkIndexOutOfRange {
                index,
                count: msg.chunks.len(),
            })?;
        if !ops.is_initialized(handle) {
            return Err(MessageError::ChunkUninitialized);
        }
        Ok(handle)
    }

    /// Whether `user` may request decryption of message `id`.
    pub fn has_grant(&self, id: u32, user: Address) -> bool {
        self.grants.contains(&(id, user))
    }

    /// Look up a message by id.
    pub fn message(&self, id: u32) -> Option<&Message> {
        self.messages.get(id as usize)
    }

    /// Total messages ever stored.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// A user's activity counters.
    pub fn stats(&self, user: Address) -> UserStats {
        self.stats.get(&user).copied().unwrap_or_default()
    }

    /// Number of index entries for a user (a self-send counts twice).
    pub fn index_len(&self, user: Address) -> usize {
        self.pages
            .get(&user)
            .map(|pages| pages.iter().map(|p| p.ids.len()).sum())
            .unwrap_or(0)
    }

    /// Number of pages currently open for a user.
    pub fn page_count(&self, user: Address) -> usize {
        self.pages.get(&user).map(|p| p.len()).unwrap_or(0)
    }

    fn append_to_index(&mut self, user: Address, id: u32) {
        let pages = self.pages.entry(user).or_default();
        match pages.last_mut() {
            Some(page) if page.ids.len() < constants::PAGE_CAPACITY => page.ids.push(id),
            _ => pages.push(Page { ids: vec![id] }),
        }
    }

    fn granted_message(&self, id: u32, caller: Address) -> Result<&Message, MessageError> {
        let msg = self
            .messages
            .get(id as usize)
            .ok_or(MessageError::NotFound(id))?;
        if !self.grants.contains(&(id, caller)) {
            return Err(MessageError::AccessDenied);
        }
        Ok(msg)
    }
}
