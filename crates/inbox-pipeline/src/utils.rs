use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fingerprint of a failed ciphertext, carried by resend requests so the
/// original sender can identify which ratchet message to retransmit.
pub fn ratchet_fingerprint(ciphertext: &[u8]) -> String {
    let digest = Sha256::digest(ciphertext);
    hex::encode(digest)
}
