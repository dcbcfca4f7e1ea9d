use crate::types::AccountId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Acknowledgement classes exchanged between devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

impl ReceiptKind {
    pub const ALL: [ReceiptKind; 3] = [ReceiptKind::Delivery, ReceiptKind::Read, ReceiptKind::Viewed];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Delivery => "delivery",
            ReceiptKind::Read => "read",
            ReceiptKind::Viewed => "viewed",
        }
    }
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Group reference carried by group-addressed content. The revision lets
/// the router decide whether local group state can answer deliverability
/// questions yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContext {
    pub group_id: String,
    pub revision: u64,
}

/// Parsed application-level payload of a decrypted envelope.
///
/// The pipeline only classifies these; handling each variant is the
/// content handler's business.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Content {
    Message {
        #[serde(default)]
        group: Option<GroupContext>,
        #[serde(default)]
        body: Option<String>,
    },
    Receipt {
        kind: ReceiptKind,
        timestamps: Vec<u64>,
    },
    Typing {
        started: bool,
        #[serde(default)]
        group: Option<GroupContext>,
    },
    Call {
        call_id: u64,
    },
    Edit {
        target_sent_timestamp: u64,
        #[serde(default)]
        group: Option<GroupContext>,
        #[serde(default)]
        body: Option<String>,
    },
    Reaction {
        emoji: String,
        target_sent_timestamp: u64,
        target_author: AccountId,
        #[serde(default)]
        remove: bool,
        #[serde(default)]
        group: Option<GroupContext>,
    },
    SenderKeyDistribution {
        /// Opaque distribution message bytes, base64. Consumed by the
        /// crypto provider during preprocessing.
        distribution: String,
    },
    Null,
}

impl Content {
    pub fn group_context(&self) -> Option<&GroupContext> {
        match self {
            Content::Message { group, .. }
            | Content::Typing { group, .. }
            | Content::Edit { group, .. }
            | Content::Reaction { group, .. } => group.as_ref(),
            _ => None,
        }
    }

    /// Timestamps of sent messages this content acknowledges as delivered,
    /// if it is a pure delivery receipt. Used for batch coalescing.
    pub fn delivery_receipt_timestamps(&self) -> Option<&[u64]> {
        match self {
            Content::Receipt {
                kind: ReceiptKind::Delivery,
                timestamps,
            } => Some(timestamps),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Content::Message { .. } => "message",
            Content::Receipt { .. } => "receipt",
            Content::Typing { .. } => "typing",
            Content::Call { .. } => "call",
            Content::Edit { .. } => "edit",
            Content::Reaction { .. } => "reaction",
            Content::SenderKeyDistribution { .. } => "senderKeyDistribution",
            Content::Null => "null",
        }
    }
}
