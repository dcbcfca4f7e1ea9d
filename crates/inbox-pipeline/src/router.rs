use crate::content::Content;
use crate::crypto_provider::SessionCryptoProvider;
use crate::envelope::{DecryptedEnvelope, Envelope};
use crate::groups::{DiscardMode, GroupStateProvider};
use crate::interactions::InteractionStore;
use crate::oracle::RecipientOracle;
use crate::storage::WriteScope;
use crate::types::DependencyKey;
use crate::{Error, Result};
use base64::Engine;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A deliverable request handed to the content handler.
#[derive(Clone, Debug)]
pub struct ReceiverRequest {
    pub decrypted: DecryptedEnvelope,
    pub content: Content,
    /// Visible content should be suppressed, but call/typing-class
    /// content should still go through.
    pub should_discard_visible: bool,
}

/// One classification per decrypted envelope. Exists only for the
/// duration of one batch item; never persisted.
pub enum ProcessingState {
    Completed(Option<Error>),
    /// Group state cannot answer deliverability yet; park the serialized
    /// envelope for replay once it catches up.
    DeferForGroup {
        envelope: DecryptedEnvelope,
        serialized: Vec<u8>,
    },
    Deliverable(ReceiverRequest),
    /// Plaintext server-generated receipt, bypassing decryption.
    ServerReceipt(Envelope),
    /// Decrypted fine but carried nothing to deliver; only placeholder
    /// bookkeeping remains.
    ClearPlaceholder(DecryptedEnvelope),
}

impl ProcessingState {
    /// Sent-message timestamps this request acknowledges as delivered,
    /// if it is purely a delivery receipt. Drives coalescing.
    pub fn delivery_receipt_timestamps(&self) -> Option<Vec<u64>> {
        match self {
            ProcessingState::ServerReceipt(envelope) => Some(vec![envelope.timestamp]),
            ProcessingState::Deliverable(request) => request
                .content
                .delivery_receipt_timestamps()
                .map(|timestamps| timestamps.to_vec()),
            _ => None,
        }
    }
}

/// What the content handler did with a deliverable request.
pub enum HandlerOutcome {
    Handled,
    /// The request references a message that has not materialized yet;
    /// the processor parks it in the early-arrival buffer.
    MissingDependency(DependencyKey),
}

/// Executes application content. External collaborator: the dozen
/// content types are handled out there; only their routing lives here.
pub trait ContentHandler: Send + Sync {
    fn handle(&self, request: &ReceiverRequest, tx: &WriteScope) -> Result<HandlerOutcome>;
}

/// Classifies one decrypted envelope into a processing state. The caller
/// executes the state within the same write scope that decrypted it,
/// then finishes bookkeeping here.
pub struct Router {
    crypto: Arc<dyn SessionCryptoProvider>,
    interactions: Arc<dyn InteractionStore>,
    oracle: Arc<dyn RecipientOracle>,
    groups: Arc<dyn GroupStateProvider>,
}

impl Router {
    pub fn new(
        crypto: Arc<dyn SessionCryptoProvider>,
        interactions: Arc<dyn InteractionStore>,
        oracle: Arc<dyn RecipientOracle>,
        groups: Arc<dyn GroupStateProvider>,
    ) -> Self {
        Self {
            crypto,
            interactions,
            oracle,
            groups,
        }
    }

    pub fn classify(&self, decrypted: DecryptedEnvelope, tx: &WriteScope) -> Result<ProcessingState> {
        let content = match decrypted.content() {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    timestamp = decrypted.envelope.timestamp,
                    "Envelope decrypted but carried no parseable content: {}", e
                );
                return Ok(ProcessingState::ClearPlaceholder(decrypted));
            }
        };

        // Preprocessing runs for every envelope, blocked senders
        // included: a sender-key distribution skipped while its sender is
        // blocked would leave the group undecryptable after an unblock.
        if let Content::SenderKeyDistribution { distribution } = &content {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(distribution)
                .map_err(|e| Error::MalformedContent(e.to_string()))?;
            self.crypto
                .process_sender_key_distribution(decrypted.source, &bytes, tx)?;
            return Ok(ProcessingState::Completed(None));
        }

        if self.oracle.is_blocked(&decrypted.source.account) {
            info!(sender = %decrypted.source, "Skipping envelope from blocked sender");
            return Ok(ProcessingState::Completed(Some(Error::BlockedSender)));
        }

        // Idempotence boundary: a redelivered envelope whose interaction
        // already exists is silently dropped.
        if self.interactions.contains_message(
            decrypted.envelope.timestamp,
            decrypted.source.account,
            tx,
        )? {
            debug!(
                timestamp = decrypted.envelope.timestamp,
                sender = %decrypted.source,
                "Dropping envelope, equivalent message already exists"
            );
            return Ok(ProcessingState::Completed(None));
        }

        if matches!(content, Content::Null) {
            info!("Received null message");
            return Ok(ProcessingState::Completed(None));
        }

        let mut should_discard_visible = false;
        if let Some(group) = content.group_context() {
            if !self.groups.can_process_now(group, tx) {
                let serialized = serde_json::to_vec(&decrypted)?;
                return Ok(ProcessingState::DeferForGroup {
                    envelope: decrypted,
                    serialized,
                });
            }
            match self
                .groups
                .discard_mode(group, decrypted.source.account, tx)
            {
                DiscardMode::Discard => return Ok(ProcessingState::Completed(None)),
                DiscardMode::Keep => {}
                DiscardMode::DiscardVisible => should_discard_visible = true,
            }
        }

        Ok(ProcessingState::Deliverable(ReceiverRequest {
            decrypted,
            content,
            should_discard_visible,
        }))
    }

    /// One multi-timestamp delivery lookup on behalf of a coalesced run.
    pub(crate) fn record_delivery_receipts(
        &self,
        recipient: crate::types::ProtocolAddress,
        timestamps: &[u64],
        delivered_at: u64,
        tx: &WriteScope,
    ) -> Result<Vec<u64>> {
        self.interactions
            .record_delivery_receipts(recipient, timestamps, delivered_at, tx)
    }

    /// Finish bookkeeping for a processed envelope: capture the spam
    /// reporting token and clear any leftover placeholder reserved for
    /// this (timestamp, sender). Runs for every classification except a
    /// group deferral.
    pub fn finish_processing(&self, decrypted: &DecryptedEnvelope, tx: &WriteScope) -> Result<()> {
        if let Some(token) = &decrypted.envelope.reporting_token {
            tx.put(
                &format!("spam/{}", decrypted.source.account.to_hex()),
                token.clone(),
            );
        }

        let removed = self.interactions.remove_placeholders(
            decrypted.envelope.timestamp,
            decrypted.source.account,
            tx,
        )?;
        if removed > 0 {
            debug!(
                timestamp = decrypted.envelope.timestamp,
                sender = %decrypted.source,
                "Cleared leftover placeholders"
            );
        }
        Ok(())
    }
}

/// Group an ordered batch into combined units: each unit is a maximal run
/// of consecutive delivery-receipt items plus the non-receipt item that
/// ends it (if any). Pure; the processor executes each unit in one write
/// scope with a single multi-timestamp lookup.
pub fn coalesce_delivery_runs(is_delivery_receipt: &[bool]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for (index, flag) in is_delivery_receipt.iter().enumerate() {
        if !flag {
            runs.push(start..index + 1);
            start = index + 1;
        }
    }
    if start < is_delivery_receipt.len() {
        runs.push(start..is_delivery_receipt.len());
    }
    runs
}
