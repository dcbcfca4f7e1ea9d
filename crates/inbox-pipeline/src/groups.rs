use crate::content::GroupContext;
use crate::envelope::DecryptedEnvelope;
use crate::storage::WriteScope;
use crate::types::AccountId;
use crate::Result;

/// Whether a group message should be processed, and how much of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardMode {
    Keep,
    /// Drop the message entirely.
    Discard,
    /// Process the message but suppress visible content; call/typing
    /// class content still goes through.
    DiscardVisible,
}

/// Group membership and revision state. External collaborator: the
/// pipeline only asks whether a group message is deliverable yet, and
/// parks messages that are not.
pub trait GroupStateProvider: Send + Sync {
    /// Can local group state answer deliverability for this context?
    /// `false` means the message must be deferred until group state
    /// catches up to the referenced revision.
    fn can_process_now(&self, group: &GroupContext, tx: &WriteScope) -> bool;

    fn discard_mode(&self, group: &GroupContext, sender: AccountId, tx: &WriteScope) -> DiscardMode;

    /// Park a serialized envelope for replay once group state updates.
    /// Runs in the same write scope that decrypted it, so the message
    /// cannot be lost between decryption and deferral.
    fn enqueue_for_group(
        &self,
        envelope: &DecryptedEnvelope,
        serialized: &[u8],
        tx: &WriteScope,
    ) -> Result<()>;
}

/// Group state that is always current. Useful for clients without group
/// support and as a test default.
pub struct ImmediateGroupState;

impl GroupStateProvider for ImmediateGroupState {
    fn can_process_now(&self, _group: &GroupContext, _tx: &WriteScope) -> bool {
        true
    }

    fn discard_mode(
        &self,
        _group: &GroupContext,
        _sender: AccountId,
        _tx: &WriteScope,
    ) -> DiscardMode {
        DiscardMode::Keep
    }

    fn enqueue_for_group(
        &self,
        _envelope: &DecryptedEnvelope,
        _serialized: &[u8],
        _tx: &WriteScope,
    ) -> Result<()> {
        Ok(())
    }
}
