use crate::envelope::PendingEnvelope;
use crate::Error;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    Duplicate,
}

pub struct Batch {
    pub envelopes: Vec<PendingEnvelope>,
    /// Total queue depth at the time the batch was taken.
    pub total_pending: usize,
}

/// Mutex-protected FIFO of not-yet-processed envelopes.
///
/// Batches are non-destructive prefixes: items are removed only after
/// they have been durably processed, so recovering from a crash mid-batch
/// is simply re-decrypting from the front.
pub struct IntakeQueue {
    pending: Mutex<Vec<PendingEnvelope>>,
}

impl IntakeQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue one envelope. Encrypted envelopes are deduplicated by
    /// server identifier against everything currently queued; a duplicate
    /// is rejected and its completion resolved with a dedicated error,
    /// never queued twice. Decrypted (re-injected) envelopes are always
    /// accepted.
    pub fn enqueue(&self, envelope: PendingEnvelope) -> EnqueueResult {
        let mut pending = self.pending.lock().unwrap();
        if pending.iter().any(|queued| envelope.is_duplicate_of(queued)) {
            warn!(
                server_guid = envelope.server_guid().unwrap_or("(none)"),
                "Dropping duplicate envelope at intake"
            );
            drop(pending);
            envelope.completion().resolve(Some(Error::DuplicateEnvelope));
            return EnqueueResult::Duplicate;
        }
        pending.push(envelope);
        EnqueueResult::Enqueued
    }

    /// A prefix of up to `batch_size` envelopes, left in place.
    pub fn next_batch(&self, batch_size: usize) -> Batch {
        let pending = self.pending.lock().unwrap();
        Batch {
            envelopes: pending.iter().take(batch_size).cloned().collect(),
            total_pending: pending.len(),
        }
    }

    /// Drop the first `count` envelopes after their batch has been
    /// durably processed.
    pub fn remove_processed(&self, count: usize) {
        let mut pending = self.pending.lock().unwrap();
        let count = count.min(pending.len());
        pending.drain(..count);
    }

    pub fn count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{completion_pair, Completion, Envelope, EnvelopeKind, PendingEnvelope};
    use crate::types::EnvelopeSource;

    fn pending_with_guid(guid: &str) -> (PendingEnvelope, Completion) {
        let (handle, completion) = completion_pair();
        let pending = PendingEnvelope::Encrypted {
            envelope: Envelope {
                server_guid: Some(guid.to_string()),
                source: None,
                timestamp: 1,
                server_timestamp: 2,
                content: vec![0],
                kind: EnvelopeKind::SealedSender,
                reporting_token: None,
            },
            server_delivery_timestamp: 3,
            source: EnvelopeSource::Tests,
            completion: handle,
        };
        (pending, completion)
    }

    #[test]
    fn duplicate_guid_is_rejected_with_callback() {
        let queue = IntakeQueue::new();
        let (first, _first_completion) = pending_with_guid("g1");
        let (second, second_completion) = pending_with_guid("g1");

        assert_eq!(queue.enqueue(first), EnqueueResult::Enqueued);
        assert_eq!(queue.enqueue(second), EnqueueResult::Duplicate);
        assert_eq!(queue.count(), 1);

        match second_completion.wait() {
            Some(Error::DuplicateEnvelope) => {}
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn batch_is_nondestructive_prefix() {
        let queue = IntakeQueue::new();
        for i in 0..5 {
            let (pending, _c) = pending_with_guid(&format!("g{}", i));
            queue.enqueue(pending);
        }

        let batch = queue.next_batch(3);
        assert_eq!(batch.envelopes.len(), 3);
        assert_eq!(batch.total_pending, 5);
        assert_eq!(queue.count(), 5);

        queue.remove_processed(3);
        assert_eq!(queue.count(), 2);
        let batch = queue.next_batch(16);
        assert_eq!(batch.envelopes[0].server_guid(), Some("g3"));
    }

    #[test]
    fn remove_processed_tolerates_overshoot() {
        let queue = IntakeQueue::new();
        let (pending, _c) = pending_with_guid("g");
        queue.enqueue(pending);
        queue.remove_processed(10);
        assert!(queue.is_empty());
    }
}
