use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch size for draining the intake queue.
pub const INCOMING_BATCH_SIZE: usize = 16;
/// Batch size while the process is memory constrained.
pub const CONSTRAINED_BATCH_SIZE: usize = 1;
/// Envelopes above this size are dropped at intake. Well behaving
/// clients never send them.
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;
/// Lower bound for the recently-processed guid ring.
pub const RECENTLY_PROCESSED_GUID_LIMIT: usize = 256;

/// Per-key cap for each early-arrival list (receipts, envelopes).
pub const EARLY_ENTRY_CAP: usize = 128;
/// Serialized envelopes above this size are never buffered.
pub const EARLY_ENVELOPE_MAX_BYTES: usize = 1024;
/// Early entries older than this are swept.
pub const EARLY_HORIZON_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Lifetime of a decryption placeholder before it becomes a visible failure.
pub const PLACEHOLDER_LIFETIME_MS: u64 = 60 * 60 * 1000;
/// Expired placeholders are deleted in batches of this size.
pub const PLACEHOLDER_SWEEP_BATCH: usize = 25;

/// Minimum interval between session-reset null messages per sender.
pub const SESSION_RESET_INTERVAL_MS: u64 = 5 * 60 * 1000;
/// Minimum interval between reactive profile key messages per sender.
pub const PROFILE_KEY_INTERVAL_MS: u64 = 48 * 60 * 60 * 1000;

/// Sleep between receipt flush cycles, allowing sends to batch up.
pub const RECEIPT_FLUSH_INTERVAL_MS: u64 = 3000;

/// Stable per-account identity key, distinct from any phone number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(Error::InvalidEnvelope("Invalid account id length".to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl Serialize for AccountId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccountId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (account, device) pair addressing one ratchet session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAddress {
    pub account: AccountId,
    pub device: DeviceId,
}

impl ProtocolAddress {
    pub fn new(account: AccountId, device: DeviceId) -> Self {
        Self { account, device }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.account, self.device)
    }
}

/// The local account's own identity.
#[derive(Clone, Copy, Debug)]
pub struct LocalIdentity {
    pub account: AccountId,
    pub device: DeviceId,
}

/// Sender-declared hint for how aggressively a decryption failure of
/// this (or related resent) content should be surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentHint {
    /// Surface a failure immediately.
    Default,
    /// The sender can resend; reserve a placeholder and wait.
    Resendable,
    /// Never surface anything to the user.
    Implicit,
}

/// Correlates a receipt/edit/reaction with its not-yet-materialized
/// target message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyKey {
    pub timestamp: u64,
    pub author: AccountId,
}

impl DependencyKey {
    pub fn new(timestamp: u64, author: AccountId) -> Self {
        Self { timestamp, author }
    }
}

/// Where an envelope came in from. Only used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeSource {
    Unknown,
    Websocket,
    Rest,
    Reinjected,
    Tests,
}

impl fmt::Display for EnvelopeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeSource::Unknown => "unknown",
            EnvelopeSource::Websocket => "websocket",
            EnvelopeSource::Rest => "rest",
            EnvelopeSource::Reinjected => "reinjected",
            EnvelopeSource::Tests => "tests",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_hex_round_trip() {
        let id = AccountId([7u8; 32]);
        let parsed = AccountId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn account_id_rejects_short_hex() {
        assert!(AccountId::from_hex("0707").is_err());
    }

    #[test]
    fn protocol_address_serde() {
        let addr = ProtocolAddress::new(AccountId([1u8; 32]), DeviceId(2));
        let json = serde_json::to_string(&addr).unwrap();
        let back: ProtocolAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, back);
    }
}
