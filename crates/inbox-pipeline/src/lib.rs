//! Incoming-message reliability pipeline for an end-to-end encrypted
//! messenger: envelope intake and dedup, exactly-once decryption with
//! session recovery, routing classification, early-arrival buffering,
//! and batched outgoing acknowledgements.

pub mod content;
pub mod crypto_provider;
pub mod decrypt;
pub mod dispatch;
pub mod early_buffer;
pub mod envelope;
mod error;
pub mod file_storage;
pub mod groups;
pub mod intake_queue;
pub mod interactions;
pub mod oracle;
pub mod processor;
pub mod receipt_batcher;
pub mod router;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod utils;

pub use content::{Content, GroupContext, ReceiptKind};
pub use crypto_provider::{
    CipherKind, CryptoError, SealedSenderFailure, SessionCryptoProvider, UnsealedEnvelope,
    UnsealedMetadata,
};
pub use decrypt::{Decryptor, ThrottleLedger};
pub use dispatch::{ChannelDispatch, MessageDispatch, OutgoingMessage, OutgoingPayload, SendError};
pub use early_buffer::{BufferedEnvelope, EarlyArrivalBuffer, EarlyItem, EarlyReceipt};
pub use envelope::{
    completion_pair, Completion, CompletionHandle, DecryptedEnvelope, Envelope, EnvelopeKind,
    PendingEnvelope,
};
pub use error::{Error, Result};
pub use file_storage::FileStorageAdapter;
pub use groups::{DiscardMode, GroupStateProvider, ImmediateGroupState};
pub use intake_queue::{Batch, EnqueueResult, IntakeQueue};
pub use interactions::{InMemoryInteractionStore, InteractionStore, Placeholder};
pub use oracle::{InMemoryOracle, RecipientOracle};
pub use processor::MessageProcessor;
pub use receipt_batcher::{ReceiptBatcher, ReceiptSet};
pub use router::{
    coalesce_delivery_runs, ContentHandler, HandlerOutcome, ProcessingState, ReceiverRequest,
    Router,
};
pub use storage::{InMemoryStorage, StorageAdapter, WriteScope};
pub use tasks::{PendingTasks, TaskGuard};
pub use types::{
    AccountId, ContentHint, DependencyKey, DeviceId, EnvelopeSource, LocalIdentity,
    ProtocolAddress,
};
