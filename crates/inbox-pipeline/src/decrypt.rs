use crate::crypto_provider::{
    CipherKind, CryptoError, SealedSenderFailure, SessionCryptoProvider, UnsealedMetadata,
};
use crate::dispatch::{MessageDispatch, OutgoingMessage, OutgoingPayload};
use crate::envelope::{DecryptedEnvelope, Envelope, EnvelopeKind};
use crate::interactions::{InteractionStore, Placeholder};
use crate::oracle::RecipientOracle;
use crate::storage::{StorageAdapter, WriteScope};
use crate::types::{
    LocalIdentity, ProtocolAddress, PLACEHOLDER_LIFETIME_MS, PLACEHOLDER_SWEEP_BATCH,
    PROFILE_KEY_INTERVAL_MS, SESSION_RESET_INTERVAL_MS,
};
use crate::utils::{now_ms, ratchet_fingerprint};
use crate::{Error, Result};
use base64::Engine;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Persisted per-subject rate limits for recovery actions. Injected into
/// the orchestrator rather than being process-global so tests can reset
/// it by handing in fresh storage.
pub struct ThrottleLedger {
    prefix: String,
}

impl ThrottleLedger {
    pub fn new() -> Self {
        Self {
            prefix: "throttle/".to_string(),
        }
    }

    fn key(&self, action: &str, subject: &str) -> String {
        format!("{}{}/{}", self.prefix, action, subject)
    }

    /// Returns whether `action` may run for `subject` now, stamping the
    /// attempt time when it may. The stamp rides the caller's write
    /// scope, so a rolled-back attempt never consumes the window.
    pub fn attempt(
        &self,
        action: &str,
        subject: &str,
        window_ms: u64,
        tx: &WriteScope,
    ) -> Result<bool> {
        let key = self.key(action, subject);
        let last: Option<u64> = tx.get(&key)?.and_then(|raw| raw.parse().ok());
        let now = now_ms();
        if let Some(last) = last {
            if now.saturating_sub(last) < window_ms {
                return Ok(false);
            }
        }
        tx.put(&key, now.to_string());
        Ok(true)
    }
}

impl Default for ThrottleLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns one queued envelope into plaintext via the crypto provider. On
/// failure it decides between silent drop, session-reset-and-notify, and
/// the resend-request protocol, rate-limiting recovery per sender.
pub struct Decryptor {
    crypto: Arc<dyn SessionCryptoProvider>,
    interactions: Arc<dyn InteractionStore>,
    dispatch: Arc<dyn MessageDispatch>,
    oracle: Arc<dyn RecipientOracle>,
    storage: Arc<dyn StorageAdapter>,
    local: LocalIdentity,
    local_profile_key: Option<Vec<u8>>,
    ledger: ThrottleLedger,
    /// (sender, device) pairs already reset during the current drain
    /// batch. Cleared when the queue fully drains.
    reset_during_batch: Mutex<HashSet<String>>,
    sweeper_tx: crossbeam_channel::Sender<u64>,
}

impl Decryptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Arc<dyn SessionCryptoProvider>,
        interactions: Arc<dyn InteractionStore>,
        dispatch: Arc<dyn MessageDispatch>,
        oracle: Arc<dyn RecipientOracle>,
        storage: Arc<dyn StorageAdapter>,
        local: LocalIdentity,
        local_profile_key: Option<Vec<u8>>,
        ledger: ThrottleLedger,
    ) -> Arc<Self> {
        let (sweeper_tx, sweeper_rx) = crossbeam_channel::unbounded();
        let decryptor = Arc::new(Self {
            crypto,
            interactions,
            dispatch,
            oracle,
            storage,
            local,
            local_profile_key,
            ledger,
            reset_during_batch: Mutex::new(HashSet::new()),
            sweeper_tx,
        });
        spawn_placeholder_sweeper(decryptor.clone(), sweeper_rx);
        decryptor
    }

    /// Decrypt one envelope inside `tx`. The caller routes receipt and
    /// key-exchange envelopes around the crypto provider; reaching here
    /// with one is a programming error surfaced as an invalid envelope.
    pub fn decrypt(&self, envelope: &Envelope, server_delivery_timestamp: u64, tx: &WriteScope) -> Result<DecryptedEnvelope> {
        match envelope.kind {
            EnvelopeKind::SealedSender => self.decrypt_sealed(envelope, server_delivery_timestamp, tx),
            EnvelopeKind::Ciphertext | EnvelopeKind::PreKeyBundle | EnvelopeKind::PlaintextContent => {
                self.decrypt_identified(envelope, server_delivery_timestamp, tx)
            }
            EnvelopeKind::Receipt | EnvelopeKind::KeyExchange | EnvelopeKind::Unknown => Err(
                Error::InvalidEnvelope(format!("Envelope kind {:?} carries no ciphertext", envelope.kind)),
            ),
        }
    }

    /// Clear the per-batch reset ledger. Called when the intake queue has
    /// fully drained, so that the next undecryptable message from a
    /// sender resets the session again.
    pub fn end_batch(&self) {
        self.reset_during_batch.lock().unwrap().clear();
    }

    fn cipher_kind(kind: EnvelopeKind) -> CipherKind {
        match kind {
            EnvelopeKind::PreKeyBundle => CipherKind::PreKey,
            EnvelopeKind::PlaintextContent => CipherKind::Plaintext,
            _ => CipherKind::Session,
        }
    }

    fn decrypt_identified(
        &self,
        envelope: &Envelope,
        server_delivery_timestamp: u64,
        tx: &WriteScope,
    ) -> Result<DecryptedEnvelope> {
        let source = envelope.source.ok_or_else(|| {
            Error::InvalidEnvelope("Identified envelope is missing a source".to_string())
        })?;
        let cipher_kind = Self::cipher_kind(envelope.kind);

        let metadata = || UnsealedMetadata {
            source,
            ciphertext: Some(envelope.content.clone()),
            cipher_kind,
            content_hint: crate::types::ContentHint::Default,
            group_id: None,
        };

        if envelope.content.is_empty() {
            return Err(self.process_error(
                CryptoError::Other("Envelope has no content".to_string()),
                envelope,
                Some(metadata()),
                tx,
            ));
        }

        let plaintext = if cipher_kind == CipherKind::Plaintext {
            envelope.content.clone()
        } else {
            match self
                .crypto
                .decrypt_session(source, cipher_kind, &envelope.content, tx)
            {
                Ok(plaintext) => plaintext,
                Err(e) => return Err(self.process_error(e, envelope, Some(metadata()), tx)),
            }
        };

        if cipher_kind == CipherKind::Session {
            // The sender reached us over an identified session even
            // though they should have our profile key. Opportunistically
            // re-share it.
            self.maybe_send_profile_key(source.account, tx)?;
        }

        Ok(DecryptedEnvelope {
            envelope: envelope.clone(),
            source,
            plaintext,
            was_sealed_sender: false,
            plaintext_cipher: cipher_kind == CipherKind::Plaintext,
            server_delivery_timestamp,
        })
    }

    fn decrypt_sealed(
        &self,
        envelope: &Envelope,
        server_delivery_timestamp: u64,
        tx: &WriteScope,
    ) -> Result<DecryptedEnvelope> {
        match self.crypto.decrypt_sealed_sender(envelope, tx) {
            Ok(unsealed) => Ok(DecryptedEnvelope {
                envelope: envelope.clone(),
                source: unsealed.source,
                plaintext: unsealed.plaintext,
                was_sealed_sender: true,
                plaintext_cipher: unsealed.cipher_kind == CipherKind::Plaintext,
                server_delivery_timestamp,
            }),
            Err(SealedSenderFailure { error, metadata }) => {
                Err(self.process_error(error, envelope, metadata, tx))
            }
        }
    }

    /// Single funnel for decryption failures. Decides what (if anything)
    /// becomes user-visible and which recovery actions run, then returns
    /// the error the envelope's completion will carry.
    fn process_error(
        &self,
        crypto_error: CryptoError,
        envelope: &Envelope,
        metadata: Option<UnsealedMetadata>,
        tx: &WriteScope,
    ) -> Error {
        if crypto_error == CryptoError::Duplicate {
            // Duplicates are never recorded and never trigger recovery.
            warn!("Duplicate ratchet message in {}", envelope.description());
            return Error::DuplicateEnvelope;
        }

        error!(
            "Error while decrypting {}: {}",
            envelope.description(),
            crypto_error
        );

        let wrapped = match &crypto_error {
            CryptoError::UntrustedIdentity => Error::UntrustedIdentity,
            other => Error::Decryption(other.to_string()),
        };

        let Some(metadata) = metadata else {
            return wrapped;
        };
        let sender = metadata.source;

        if self.oracle.is_blocked(&sender.account) || self.oracle.is_hidden(&sender.account) {
            info!(
                sender = %sender,
                "Ignoring decryption error for blocked or hidden sender"
            );
            return wrapped;
        }

        if crypto_error == CryptoError::UntrustedIdentity {
            // Recorded, but recovery requires an explicit trust decision.
            if let Err(e) = self.interactions.insert_failure_notice(
                sender.account,
                envelope.timestamp,
                metadata.group_id.as_deref(),
                tx,
            ) {
                warn!("Failed to record untrusted identity notice: {}", e);
            }
            return wrapped;
        }

        match metadata.content_hint {
            crate::types::ContentHint::Default => {
                if let Err(e) = self.interactions.insert_failure_notice(
                    sender.account,
                    envelope.timestamp,
                    metadata.group_id.as_deref(),
                    tx,
                ) {
                    warn!("Failed to record decryption failure notice: {}", e);
                }
            }
            crate::types::ContentHint::Resendable => {
                let inserted_at = now_ms();
                let expires_at = inserted_at + PLACEHOLDER_LIFETIME_MS;
                let placeholder = Placeholder {
                    timestamp: envelope.timestamp,
                    sender: sender.account,
                    group_id: metadata.group_id.clone(),
                    inserted_at,
                    expires_at,
                };
                match self.interactions.insert_placeholder(placeholder, tx) {
                    Ok(()) => self.schedule_placeholder_sweep(expires_at),
                    Err(e) => warn!("Failed to insert placeholder: {}", e),
                }
            }
            crate::types::ContentHint::Implicit => {}
        }

        self.reset_session_if_necessary(sender, tx);
        if let Err(e) = self.send_resend_request(envelope, &metadata, tx) {
            warn!(sender = %sender, "Failed to request resend: {}", e);
        }

        wrapped
    }

    /// Archive the sender's session at most once per (sender, device) per
    /// drain batch. A backlog of fifty undecryptable messages from one
    /// device must not reset the session fifty times.
    fn reset_session_if_necessary(&self, sender: ProtocolAddress, tx: &WriteScope) -> bool {
        let sender_id = sender.to_string();
        if !self.reset_during_batch.lock().unwrap().insert(sender_id.clone()) {
            warn!(
                sender = %sender_id,
                "Skipping session reset, already reset during this batch"
            );
            return false;
        }

        warn!(sender = %sender_id, "Archiving session for undecryptable message");
        self.crypto.archive_session(sender, tx);
        self.try_send_null_message(sender.account, tx);
        true
    }

    fn try_send_null_message(&self, sender: crate::types::AccountId, tx: &WriteScope) {
        let allowed = match self.ledger.attempt(
            "null-message",
            &sender.to_hex(),
            SESSION_RESET_INTERVAL_MS,
            tx,
        ) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Null message throttle check failed: {}", e);
                return;
            }
        };
        if !allowed {
            warn!(sender = %sender, "Skipping null message, sent one recently");
            return;
        }

        info!(sender = %sender, "Sending null message to reset session");
        self.dispatch.enqueue(
            OutgoingMessage::new(sender, OutgoingPayload::SessionResetNull),
            tx,
        );
    }

    /// Ask the original sender to retransmit content we could not
    /// decrypt. Best effort: the message rides the normal outgoing queue.
    /// Always requested, even when the content hint says the sender
    /// cannot fulfill it, because the request also tells the sender to
    /// reset the session.
    fn send_resend_request(
        &self,
        envelope: &Envelope,
        metadata: &UnsealedMetadata,
        tx: &WriteScope,
    ) -> Result<()> {
        if !self.ledger.attempt(
            "resend-request",
            &metadata.source.account.to_hex(),
            SESSION_RESET_INTERVAL_MS,
            tx,
        )? {
            warn!(
                sender = %metadata.source,
                "Skipping resend request, one was sent recently"
            );
            return Ok(());
        }

        let (fingerprint, audit) = if metadata.cipher_kind.is_group() {
            let group = metadata.group_id.as_deref().unwrap_or("(unknown)");
            (
                None,
                Some(format!("sender-key decryption failure in group {}", group)),
            )
        } else {
            (
                metadata
                    .ciphertext
                    .as_deref()
                    .map(ratchet_fingerprint),
                None,
            )
        };

        info!(
            sender = %metadata.source,
            hint = ?metadata.content_hint,
            timestamp = envelope.timestamp,
            "Requesting resend of undecryptable content"
        );
        self.dispatch.enqueue(
            OutgoingMessage::new(
                metadata.source.account,
                OutgoingPayload::DecryptionErrorReport {
                    timestamp: envelope.timestamp,
                    device: metadata.source.device,
                    ratchet_fingerprint: fingerprint,
                    sender_key_audit: audit,
                    group_id: metadata.group_id.clone(),
                },
            ),
            tx,
        );
        Ok(())
    }

    fn maybe_send_profile_key(&self, sender: crate::types::AccountId, tx: &WriteScope) -> Result<()> {
        if sender == self.local.account {
            return Ok(());
        }
        if !self.oracle.is_profile_whitelisted(&sender) || self.oracle.is_blocked(&sender) {
            return Ok(());
        }
        let Some(profile_key) = &self.local_profile_key else {
            return Ok(());
        };

        if !self
            .ledger
            .attempt("profile-key", &sender.to_hex(), PROFILE_KEY_INTERVAL_MS, tx)?
        {
            debug!(sender = %sender, "Skipping reactive profile key, sent one recently");
            return Ok(());
        }

        info!(sender = %sender, "Sending reactive profile key");
        self.dispatch.enqueue(
            OutgoingMessage::new(
                sender,
                OutgoingPayload::ProfileKey {
                    profile_key: base64::engine::general_purpose::STANDARD.encode(profile_key),
                },
            ),
            tx,
        );
        Ok(())
    }

    fn schedule_placeholder_sweep(&self, expires_at: u64) {
        let _ = self.sweeper_tx.send(expires_at);
    }

    /// Delete expired placeholders and surface their deferred failure
    /// notices. Returns the next pending expiration, if any. Called at
    /// startup and by the sweep timer.
    pub fn sweep_expired_placeholders(&self) -> Result<Option<u64>> {
        let now = now_ms();
        let read_scope = WriteScope::new(self.storage.clone());
        let placeholders = self.interactions.placeholders(&read_scope)?;

        let mut expired = Vec::new();
        let mut next_expiration: Option<u64> = None;
        for placeholder in placeholders {
            if placeholder.expires_at <= now {
                expired.push(placeholder);
            } else {
                next_expiration = Some(match next_expiration {
                    Some(current) => current.min(placeholder.expires_at),
                    None => placeholder.expires_at,
                });
            }
        }

        for chunk in expired.chunks(PLACEHOLDER_SWEEP_BATCH) {
            let scope = WriteScope::new(self.storage.clone());
            for placeholder in chunk {
                info!(
                    timestamp = placeholder.timestamp,
                    sender = %placeholder.sender,
                    "Cleaning up expired placeholder"
                );
                self.interactions.remove_placeholders(
                    placeholder.timestamp,
                    placeholder.sender,
                    &scope,
                )?;
                self.interactions.insert_failure_notice(
                    placeholder.sender,
                    placeholder.timestamp,
                    placeholder.group_id.as_deref(),
                    &scope,
                )?;
            }
            scope.commit()?;
        }

        Ok(next_expiration)
    }
}

/// Timer thread for placeholder expiry: keeps the nearest known deadline,
/// re-armed by every insert that lowers it, and rescheduled (never
/// cancelled) after each sweep. Exits when the decryptor goes away.
fn spawn_placeholder_sweeper(
    decryptor: Arc<Decryptor>,
    deadline_rx: crossbeam_channel::Receiver<u64>,
) {
    let decryptor = Arc::downgrade(&decryptor);
    thread::spawn(move || {
        let mut next_deadline: Option<u64> = None;
        loop {
            let received = match next_deadline {
                Some(deadline) => {
                    let wait = Duration::from_millis(deadline.saturating_sub(now_ms()));
                    match deadline_rx.recv_timeout(wait) {
                        Ok(deadline) => Some(deadline),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match deadline_rx.recv() {
                    Ok(deadline) => Some(deadline),
                    Err(_) => break,
                },
            };

            match received {
                Some(deadline) => {
                    next_deadline = Some(match next_deadline {
                        Some(current) => current.min(deadline),
                        None => deadline,
                    });
                }
                None => {
                    // Deadline elapsed.
                    let Some(decryptor) = decryptor.upgrade() else {
                        break;
                    };
                    match decryptor.sweep_expired_placeholders() {
                        Ok(next) => next_deadline = next,
                        Err(e) => {
                            warn!("Placeholder sweep failed: {}", e);
                            next_deadline = None;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OutgoingPayload;
    use crate::interactions::InMemoryInteractionStore;
    use crate::oracle::InMemoryOracle;
    use crate::storage::InMemoryStorage;
    use crate::types::{AccountId, ContentHint, DeviceId};

    struct FailingCrypto {
        error: CryptoError,
    }

    impl SessionCryptoProvider for FailingCrypto {
        fn decrypt_session(
            &self,
            _address: ProtocolAddress,
            _kind: CipherKind,
            _ciphertext: &[u8],
            _tx: &WriteScope,
        ) -> std::result::Result<Vec<u8>, CryptoError> {
            Err(self.error.clone())
        }

        fn decrypt_sealed_sender(
            &self,
            envelope: &Envelope,
            _tx: &WriteScope,
        ) -> std::result::Result<crate::crypto_provider::UnsealedEnvelope, SealedSenderFailure>
        {
            Err(SealedSenderFailure {
                error: self.error.clone(),
                metadata: Some(UnsealedMetadata {
                    source: ProtocolAddress::new(AccountId([1u8; 32]), DeviceId(1)),
                    ciphertext: Some(envelope.content.clone()),
                    cipher_kind: CipherKind::Session,
                    content_hint: ContentHint::Resendable,
                    group_id: None,
                }),
            })
        }

        fn archive_session(&self, _address: ProtocolAddress, _tx: &WriteScope) {}

        fn process_sender_key_distribution(
            &self,
            _sender: ProtocolAddress,
            _distribution: &[u8],
            _tx: &WriteScope,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingDispatch {
        messages: Mutex<Vec<OutgoingMessage>>,
    }

    impl RecordingDispatch {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }

        fn payloads(&self) -> Vec<OutgoingMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl MessageDispatch for RecordingDispatch {
        fn enqueue(&self, message: OutgoingMessage, _tx: &WriteScope) {
            self.messages.lock().unwrap().push(message);
        }

        fn send_receipts(
            &self,
            _destination: AccountId,
            _kind: crate::content::ReceiptKind,
            _receipts: &crate::receipt_batcher::ReceiptSet,
        ) -> std::result::Result<(), crate::dispatch::SendError> {
            Ok(())
        }
    }

    fn envelope(kind: EnvelopeKind, source: Option<ProtocolAddress>) -> Envelope {
        Envelope {
            server_guid: Some("guid".to_string()),
            source,
            timestamp: 1000,
            server_timestamp: 1001,
            content: vec![9, 9, 9],
            kind,
            reporting_token: None,
        }
    }

    fn build(
        error: CryptoError,
    ) -> (
        Arc<Decryptor>,
        Arc<InMemoryInteractionStore>,
        Arc<RecordingDispatch>,
        Arc<InMemoryStorage>,
    ) {
        let interactions = Arc::new(InMemoryInteractionStore::new());
        let dispatch = RecordingDispatch::new();
        let storage = Arc::new(InMemoryStorage::new());
        let decryptor = Decryptor::new(
            Arc::new(FailingCrypto { error }),
            interactions.clone(),
            dispatch.clone(),
            Arc::new(InMemoryOracle::new()),
            storage.clone(),
            LocalIdentity {
                account: AccountId([0u8; 32]),
                device: DeviceId(1),
            },
            None,
            ThrottleLedger::new(),
        );
        (decryptor, interactions, dispatch, storage)
    }

    fn sender() -> ProtocolAddress {
        ProtocolAddress::new(AccountId([1u8; 32]), DeviceId(1))
    }

    #[test]
    fn default_hint_failure_records_notice_and_requests_resend() {
        let (decryptor, interactions, dispatch, storage) = build(CryptoError::NoSession);
        let tx = WriteScope::new(storage);

        let result = decryptor.decrypt(&envelope(EnvelopeKind::Ciphertext, Some(sender())), 0, &tx);
        assert!(matches!(result, Err(Error::Decryption(_))));

        assert_eq!(interactions.failure_notices().len(), 1);
        let payloads = dispatch.payloads();
        assert!(payloads.iter().any(|m| matches!(
            m.payload,
            OutgoingPayload::DecryptionErrorReport { .. }
        )));
        assert!(payloads
            .iter()
            .any(|m| matches!(m.payload, OutgoingPayload::SessionResetNull)));
    }

    #[test]
    fn resendable_hint_inserts_placeholder_not_notice() {
        let (decryptor, interactions, _dispatch, storage) = build(CryptoError::NoSession);
        let tx = WriteScope::new(storage);

        let result = decryptor.decrypt(&envelope(EnvelopeKind::SealedSender, None), 0, &tx);
        assert!(result.is_err());

        assert_eq!(interactions.placeholder_count(), 1);
        assert!(interactions.failure_notices().is_empty());
    }

    #[test]
    fn duplicate_counter_is_silent() {
        let (decryptor, interactions, dispatch, storage) = build(CryptoError::Duplicate);
        let tx = WriteScope::new(storage);

        let result = decryptor.decrypt(&envelope(EnvelopeKind::Ciphertext, Some(sender())), 0, &tx);
        assert!(matches!(result, Err(Error::DuplicateEnvelope)));

        assert!(interactions.failure_notices().is_empty());
        assert!(dispatch.payloads().is_empty());
    }

    #[test]
    fn untrusted_identity_is_recorded_but_not_recovered() {
        let (decryptor, interactions, dispatch, storage) = build(CryptoError::UntrustedIdentity);
        let tx = WriteScope::new(storage);

        let result = decryptor.decrypt(&envelope(EnvelopeKind::Ciphertext, Some(sender())), 0, &tx);
        assert!(matches!(result, Err(Error::UntrustedIdentity)));

        assert_eq!(interactions.failure_notices().len(), 1);
        assert!(dispatch.payloads().is_empty());
    }

    #[test]
    fn session_reset_throttled_within_batch() {
        let (decryptor, _interactions, dispatch, storage) = build(CryptoError::NoSession);

        for _ in 0..2 {
            let tx = WriteScope::new(storage.clone());
            let _ = decryptor.decrypt(&envelope(EnvelopeKind::Ciphertext, Some(sender())), 0, &tx);
            tx.commit().unwrap();
        }

        let nulls = dispatch
            .payloads()
            .iter()
            .filter(|m| matches!(m.payload, OutgoingPayload::SessionResetNull))
            .count();
        assert_eq!(nulls, 1);

        // A new batch resets the in-memory ledger, but the persisted
        // null-message window still applies.
        decryptor.end_batch();
        let tx = WriteScope::new(storage.clone());
        let _ = decryptor.decrypt(&envelope(EnvelopeKind::Ciphertext, Some(sender())), 0, &tx);
        tx.commit().unwrap();

        let nulls = dispatch
            .payloads()
            .iter()
            .filter(|m| matches!(m.payload, OutgoingPayload::SessionResetNull))
            .count();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn expired_placeholders_become_failure_notices() {
        let (decryptor, interactions, _dispatch, storage) = build(CryptoError::NoSession);

        let tx = WriteScope::new(storage);
        interactions
            .insert_placeholder(
                Placeholder {
                    timestamp: 77,
                    sender: sender().account,
                    group_id: None,
                    inserted_at: 0,
                    expires_at: 1,
                },
                &tx,
            )
            .unwrap();

        let next = decryptor.sweep_expired_placeholders().unwrap();
        assert_eq!(next, None);
        assert_eq!(interactions.placeholder_count(), 0);
        assert_eq!(interactions.failure_notices(), vec![(sender().account, 77)]);
    }
}
