use crate::storage::WriteScope;
use crate::types::{AccountId, ProtocolAddress};
use crate::Result;
use std::collections::HashSet;
use std::sync::Mutex;

/// A reserved, initially-contentless interaction marking a message's
/// ordering position while we wait for a successful resend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placeholder {
    pub timestamp: u64,
    pub sender: AccountId,
    pub group_id: Option<String>,
    pub inserted_at: u64,
    pub expires_at: u64,
}

/// Ordered interaction store. External collaborator: exact-match lookup
/// by (timestamp, author) for dedup and receipt targeting, plus insert
/// and removal of placeholder and failure-notice records. Implementations
/// are expected to enlist in the caller's write scope.
pub trait InteractionStore: Send + Sync {
    /// Does a message with this (timestamp, author) already exist? This
    /// is the idempotence boundary for redelivered envelopes.
    fn contains_message(&self, timestamp: u64, author: AccountId, tx: &WriteScope) -> Result<bool>;

    /// Insert a user-visible decryption failure record.
    fn insert_failure_notice(
        &self,
        sender: AccountId,
        timestamp: u64,
        group_id: Option<&str>,
        tx: &WriteScope,
    ) -> Result<()>;

    fn insert_placeholder(&self, placeholder: Placeholder, tx: &WriteScope) -> Result<()>;

    /// Remove any placeholders reserved for this (timestamp, author).
    /// Returns how many were removed.
    fn remove_placeholders(
        &self,
        timestamp: u64,
        author: AccountId,
        tx: &WriteScope,
    ) -> Result<usize>;

    fn placeholders(&self, tx: &WriteScope) -> Result<Vec<Placeholder>>;

    /// Mark sent messages with the given timestamps as delivered to
    /// `recipient`. One multi-timestamp lookup so coalesced delivery
    /// receipts avoid repeated fetches. Returns the timestamps that
    /// matched no sent message (candidates for the early-arrival buffer).
    fn record_delivery_receipts(
        &self,
        recipient: ProtocolAddress,
        sent_timestamps: &[u64],
        delivered_at: u64,
        tx: &WriteScope,
    ) -> Result<Vec<u64>>;
}

/// In-memory interaction store for tests and examples.
#[derive(Default)]
pub struct InMemoryInteractionStore {
    messages: Mutex<HashSet<(u64, AccountId)>>,
    placeholders: Mutex<Vec<Placeholder>>,
    failure_notices: Mutex<Vec<(AccountId, u64)>>,
    deliveries: Mutex<Vec<(ProtocolAddress, u64, u64)>>,
}

impl InMemoryInteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize a sent/received message directly, outside the
    /// pipeline. Test seam.
    pub fn insert_message(&self, timestamp: u64, author: AccountId) {
        self.messages.lock().unwrap().insert((timestamp, author));
    }

    pub fn failure_notices(&self) -> Vec<(AccountId, u64)> {
        self.failure_notices.lock().unwrap().clone()
    }

    pub fn recorded_deliveries(&self) -> Vec<(ProtocolAddress, u64, u64)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.lock().unwrap().len()
    }
}

impl InteractionStore for InMemoryInteractionStore {
    fn contains_message(
        &self,
        timestamp: u64,
        author: AccountId,
        _tx: &WriteScope,
    ) -> Result<bool> {
        Ok(self.messages.lock().unwrap().contains(&(timestamp, author)))
    }

    fn insert_failure_notice(
        &self,
        sender: AccountId,
        timestamp: u64,
        _group_id: Option<&str>,
        _tx: &WriteScope,
    ) -> Result<()> {
        self.failure_notices.lock().unwrap().push((sender, timestamp));
        Ok(())
    }

    fn insert_placeholder(&self, placeholder: Placeholder, _tx: &WriteScope) -> Result<()> {
        self.placeholders.lock().unwrap().push(placeholder);
        Ok(())
    }

    fn remove_placeholders(
        &self,
        timestamp: u64,
        author: AccountId,
        _tx: &WriteScope,
    ) -> Result<usize> {
        let mut placeholders = self.placeholders.lock().unwrap();
        let before = placeholders.len();
        placeholders.retain(|p| !(p.timestamp == timestamp && p.sender == author));
        Ok(before - placeholders.len())
    }

    fn placeholders(&self, _tx: &WriteScope) -> Result<Vec<Placeholder>> {
        Ok(self.placeholders.lock().unwrap().clone())
    }

    fn record_delivery_receipts(
        &self,
        recipient: ProtocolAddress,
        sent_timestamps: &[u64],
        delivered_at: u64,
        _tx: &WriteScope,
    ) -> Result<Vec<u64>> {
        let messages = self.messages.lock().unwrap();
        let mut unmatched = Vec::new();
        let mut deliveries = self.deliveries.lock().unwrap();
        for &timestamp in sent_timestamps {
            if messages.iter().any(|(ts, _)| *ts == timestamp) {
                deliveries.push((recipient, timestamp, delivered_at));
            } else {
                unmatched.push(timestamp);
            }
        }
        Ok(unmatched)
    }
}
