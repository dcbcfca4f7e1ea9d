use crate::envelope::Envelope;
use crate::storage::WriteScope;
use crate::types::{ContentHint, ProtocolAddress};
use crate::Result;
use thiserror::Error;

/// Failure kinds reported by the session crypto provider. The pipeline
/// maps each to a distinct recovery strategy; they are mutually exclusive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("No session for sender")]
    NoSession,

    #[error("Stale identity for sender")]
    StaleIdentity,

    #[error("Replayed ratchet counter")]
    Duplicate,

    #[error("Untrusted identity key")]
    UntrustedIdentity,

    #[error("Crypto error: {0}")]
    Other(String),
}

/// The cipher protecting one payload. Sealed-sender envelopes reveal
/// their inner cipher kind only after the outer unwrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    /// Established 1:1 ratchet session message.
    Session,
    /// Session-establishing message carrying pre-key material.
    PreKey,
    /// Group fan-out sender-key cipher.
    SenderKey,
    /// Plaintext passthrough (decryption-error reports and the like).
    Plaintext,
}

impl CipherKind {
    pub fn is_group(&self) -> bool {
        matches!(self, CipherKind::SenderKey)
    }
}

/// Result of a successful sealed-sender unwrap. Sender identity is a side
/// effect of the unwrap; it is unknown before decryption.
#[derive(Clone, Debug)]
pub struct UnsealedEnvelope {
    pub source: ProtocolAddress,
    pub plaintext: Vec<u8>,
    pub cipher_kind: CipherKind,
}

/// What the provider learned about a sealed envelope before the inner
/// decryption failed. Drives per-hint recovery.
#[derive(Clone, Debug)]
pub struct UnsealedMetadata {
    pub source: ProtocolAddress,
    pub ciphertext: Option<Vec<u8>>,
    pub cipher_kind: CipherKind,
    pub content_hint: ContentHint,
    pub group_id: Option<String>,
}

#[derive(Debug)]
pub struct SealedSenderFailure {
    pub error: CryptoError,
    /// Present when the outer unwrap succeeded and only the inner
    /// session decryption failed.
    pub metadata: Option<UnsealedMetadata>,
}

/// Decrypts and encrypts against per-device ratchet sessions.
///
/// External collaborator: the pipeline never touches key material, it
/// only orchestrates calls and maps failures to recovery actions. All
/// session mutation happens inside the caller's write scope.
pub trait SessionCryptoProvider: Send + Sync {
    fn decrypt_session(
        &self,
        address: ProtocolAddress,
        kind: CipherKind,
        ciphertext: &[u8],
        tx: &WriteScope,
    ) -> std::result::Result<Vec<u8>, CryptoError>;

    fn decrypt_sealed_sender(
        &self,
        envelope: &Envelope,
        tx: &WriteScope,
    ) -> std::result::Result<UnsealedEnvelope, SealedSenderFailure>;

    /// Archive the current session for this device so the next inbound
    /// message establishes a fresh one.
    fn archive_session(&self, address: ProtocolAddress, tx: &WriteScope);

    /// Absorb a sender-key distribution message. Runs for every sender,
    /// blocked or not, so group state stays decryptable across
    /// block/unblock cycles.
    fn process_sender_key_distribution(
        &self,
        sender: ProtocolAddress,
        distribution: &[u8],
        tx: &WriteScope,
    ) -> Result<()>;
}
