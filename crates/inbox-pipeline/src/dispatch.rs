use crate::content::ReceiptKind;
use crate::receipt_batcher::ReceiptSet;
use crate::storage::WriteScope;
use crate::types::{AccountId, DeviceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message prepared for the outgoing dispatch queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub destination: AccountId,
    pub payload: OutgoingPayload,
}

impl OutgoingMessage {
    pub fn new(destination: AccountId, payload: OutgoingPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            destination,
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutgoingPayload {
    /// Ask the original sender to retransmit content that failed to
    /// decrypt. Carries the ratchet fingerprint of the failed ciphertext
    /// for 1:1 sessions, or a sender-key audit note for group cipher.
    DecryptionErrorReport {
        timestamp: u64,
        device: DeviceId,
        #[serde(default)]
        ratchet_fingerprint: Option<String>,
        #[serde(default)]
        sender_key_audit: Option<String>,
        #[serde(default)]
        group_id: Option<String>,
    },
    /// Contentless message that carries fresh session establishment
    /// material after an archive.
    SessionResetNull,
    /// Re-share the local profile key with a sender who should already
    /// have it.
    ProfileKey { profile_key: String },
    /// One batched acknowledgement send covering a whole pending set.
    ReceiptBatch {
        kind: ReceiptKind,
        receipts: ReceiptSet,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Terminal: the destination account no longer exists.
    #[error("Recipient unknown")]
    RecipientUnknown,

    /// Network or server failure; retry on the next flush cycle.
    #[error("Transient send failure: {0}")]
    Transient(String),
}

/// Outgoing message dispatch queue. External collaborator providing
/// best-effort reliable delivery.
pub trait MessageDispatch: Send + Sync {
    /// Hand a message to the outgoing queue once the current write scope
    /// commits. Fire and forget; the queue owns retries.
    fn enqueue(&self, message: OutgoingMessage, tx: &WriteScope);

    /// Synchronously send one acknowledgement batch and report the
    /// outcome, so the receipt batcher can decide what to clear.
    fn send_receipts(
        &self,
        destination: AccountId,
        kind: ReceiptKind,
        receipts: &ReceiptSet,
    ) -> std::result::Result<(), SendError>;
}

/// Channel-backed dispatch: messages are forwarded to a consumer thread
/// that owns the actual network send.
pub struct ChannelDispatch {
    tx: crossbeam_channel::Sender<OutgoingMessage>,
}

impl ChannelDispatch {
    pub fn new(tx: crossbeam_channel::Sender<OutgoingMessage>) -> Self {
        Self { tx }
    }
}

impl MessageDispatch for ChannelDispatch {
    fn enqueue(&self, message: OutgoingMessage, tx: &WriteScope) {
        let sender = self.tx.clone();
        tx.add_completion(move || {
            let _ = sender.send(message);
        });
    }

    fn send_receipts(
        &self,
        destination: AccountId,
        kind: ReceiptKind,
        receipts: &ReceiptSet,
    ) -> std::result::Result<(), SendError> {
        let message = OutgoingMessage::new(
            destination,
            OutgoingPayload::ReceiptBatch {
                kind,
                receipts: receipts.clone(),
            },
        );
        self.tx
            .send(message)
            .map_err(|_| SendError::Transient("Dispatch channel closed".to_string()))
    }
}
