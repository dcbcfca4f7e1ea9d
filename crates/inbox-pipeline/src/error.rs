use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate envelope")]
    DuplicateEnvelope,

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Untrusted identity")]
    UntrustedIdentity,

    #[error("Sender is blocked")]
    BlockedSender,

    #[error("Malformed content: {0}")]
    MalformedContent(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Envelope too large: {0} bytes")]
    EnvelopeTooLarge(usize),

    #[error("Recipient unknown")]
    RecipientUnknown,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Processing abandoned before completion")]
    Abandoned,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, Error>;
