use crate::content::Content;
use crate::types::{EnvelopeSource, ProtocolAddress};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Transport-declared envelope type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Ciphertext,
    PreKeyBundle,
    SealedSender,
    PlaintextContent,
    Receipt,
    KeyExchange,
    Unknown,
}

impl EnvelopeKind {
    /// Receipt, key-exchange, and unknown envelopes carry no ciphertext
    /// and bypass the crypto provider entirely.
    pub fn has_ciphertext(&self) -> bool {
        !matches!(
            self,
            EnvelopeKind::Receipt | EnvelopeKind::KeyExchange | EnvelopeKind::Unknown
        )
    }
}

/// One opaque transport envelope. Immutable once received.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Server-issued identifier. Absent for legacy sources.
    #[serde(default)]
    pub server_guid: Option<String>,
    /// Sender address. Absent pre-decryption for sealed-sender envelopes.
    #[serde(default)]
    pub source: Option<ProtocolAddress>,
    /// Millisecond send timestamp chosen by the sender.
    pub timestamp: u64,
    /// Millisecond timestamp the server received the envelope.
    pub server_timestamp: u64,
    #[serde(with = "serde_base64", default)]
    pub content: Vec<u8>,
    pub kind: EnvelopeKind,
    /// Opaque spam-reporting token, captured during finish bookkeeping.
    #[serde(default)]
    pub reporting_token: Option<String>,
}

impl Envelope {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidEnvelope(format!("Unparseable envelope: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn description(&self) -> String {
        format!(
            "<Envelope kind: {:?}, source: {}, timestamp: {}, serverGuid: {}, content.len: {}>",
            self.kind,
            self.source
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(unknown)".to_string()),
            self.timestamp,
            self.server_guid.as_deref().unwrap_or("(none)"),
            self.content.len(),
        )
    }
}

/// An envelope whose plaintext is available.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedEnvelope {
    pub envelope: Envelope,
    /// Sender address, known for certain after decryption.
    pub source: ProtocolAddress,
    #[serde(with = "serde_base64")]
    pub plaintext: Vec<u8>,
    pub was_sealed_sender: bool,
    /// Whether the wire cipher was the plaintext passthrough kind.
    pub plaintext_cipher: bool,
    pub server_delivery_timestamp: u64,
}

impl DecryptedEnvelope {
    pub fn content(&self) -> Result<Content> {
        serde_json::from_slice(&self.plaintext)
            .map_err(|e| Error::MalformedContent(e.to_string()))
    }
}

/// Receiving end for one envelope's outcome.
pub struct Completion {
    rx: crossbeam_channel::Receiver<Option<Error>>,
}

impl Completion {
    /// Block until the envelope finishes processing. Returns the error it
    /// completed with, if any.
    pub fn wait(self) -> Option<Error> {
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Some(Error::Abandoned),
        }
    }

    pub fn wait_timeout(self, timeout: std::time::Duration) -> Option<Option<Error>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(Some(Error::Abandoned)),
        }
    }
}

/// Resolves a `Completion` exactly once. A second resolution is a
/// programming error and panics in debug builds.
pub struct CompletionHandle {
    tx: Mutex<Option<crossbeam_channel::Sender<Option<Error>>>>,
}

impl CompletionHandle {
    pub fn resolve(&self, outcome: Option<Error>) {
        let taken = self.tx.lock().unwrap().take();
        match taken {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug_assert!(false, "completion resolved twice");
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

pub fn completion_pair() -> (Arc<CompletionHandle>, Completion) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        Arc::new(CompletionHandle {
            tx: Mutex::new(Some(tx)),
        }),
        Completion { rx },
    )
}

/// A queued envelope awaiting its one decryption attempt. Either still
/// encrypted, or already decrypted and re-injected (legacy sources,
/// early-arrival replay).
#[derive(Clone)]
pub enum PendingEnvelope {
    Encrypted {
        envelope: Envelope,
        server_delivery_timestamp: u64,
        source: EnvelopeSource,
        completion: Arc<CompletionHandle>,
    },
    Decrypted {
        envelope: DecryptedEnvelope,
        completion: Arc<CompletionHandle>,
    },
}

impl PendingEnvelope {
    pub fn server_guid(&self) -> Option<&str> {
        match self {
            PendingEnvelope::Encrypted { envelope, .. } => envelope.server_guid.as_deref(),
            PendingEnvelope::Decrypted { envelope, .. } => envelope.envelope.server_guid.as_deref(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            PendingEnvelope::Encrypted { envelope, .. } => envelope.timestamp,
            PendingEnvelope::Decrypted { envelope, .. } => envelope.envelope.timestamp,
        }
    }

    pub fn completion(&self) -> &Arc<CompletionHandle> {
        match self {
            PendingEnvelope::Encrypted { completion, .. }
            | PendingEnvelope::Decrypted { completion, .. } => completion,
        }
    }

    /// Pre-decryption duplicate detection compares server identifiers and
    /// applies to encrypted envelopes only. Re-injected decrypted
    /// envelopes are assumed already unique upstream; that asymmetry is
    /// preserved deliberately (see DESIGN.md).
    pub fn is_duplicate_of(&self, other: &PendingEnvelope) -> bool {
        let (PendingEnvelope::Encrypted { .. }, PendingEnvelope::Encrypted { .. }) = (self, other)
        else {
            return false;
        };
        match (self.server_guid(), other.server_guid()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

pub(crate) mod serde_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
