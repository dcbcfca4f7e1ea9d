use crate::crypto_provider::SessionCryptoProvider;
use crate::decrypt::{Decryptor, ThrottleLedger};
use crate::dispatch::MessageDispatch;
use crate::early_buffer::{BufferedEnvelope, EarlyArrivalBuffer, EarlyItem, EarlyReceipt};
use crate::envelope::{
    completion_pair, Completion, DecryptedEnvelope, Envelope, EnvelopeKind, PendingEnvelope,
};
use crate::groups::GroupStateProvider;
use crate::intake_queue::IntakeQueue;
use crate::interactions::InteractionStore;
use crate::oracle::RecipientOracle;
use crate::router::{ContentHandler, HandlerOutcome, ProcessingState, Router};
use crate::storage::{StorageAdapter, WriteScope};
use crate::types::{
    DependencyKey, EnvelopeSource, LocalIdentity, ProtocolAddress, CONSTRAINED_BATCH_SIZE,
    INCOMING_BATCH_SIZE, MAX_ENVELOPE_BYTES, RECENTLY_PROCESSED_GUID_LIMIT,
};
use crate::utils::now_ms;
use crate::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

/// Bounded ring of recently processed server guids, consulted at
/// classification time to drop redeliveries that raced the queue-level
/// dedup.
struct RecentGuids {
    order: VecDeque<String>,
    seen: HashSet<String>,
    limit: usize,
}

impl RecentGuids {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            limit: RECENTLY_PROCESSED_GUID_LIMIT,
        }
    }

    fn grow_limit(&mut self, queue_depth: usize) {
        if queue_depth > self.limit {
            self.limit = queue_depth;
        }
    }

    fn contains(&self, guid: &str) -> bool {
        self.seen.contains(guid)
    }

    fn push(&mut self, guid: String) {
        if !self.seen.insert(guid.clone()) {
            return;
        }
        self.order.push_back(guid);
        while self.order.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// The pipeline front door: accepts envelopes, drains them through
/// decryption and routing one batch at a time, and owns the glue between
/// the queue, the decryptor, the router, and the early-arrival buffer.
pub struct MessageProcessor {
    queue: IntakeQueue,
    decryptor: Arc<Decryptor>,
    router: Router,
    early: Arc<EarlyArrivalBuffer>,
    content_handler: Arc<dyn ContentHandler>,
    groups: Arc<dyn GroupStateProvider>,
    storage: Arc<dyn StorageAdapter>,
    local: LocalIdentity,
    recently_processed: Mutex<RecentGuids>,
    processing_permitted: AtomicBool,
    memory_constrained: AtomicBool,
    is_draining: AtomicBool,
    stopped: AtomicBool,
    drain_tx: crossbeam_channel::Sender<()>,
    drain_rx: Mutex<Option<crossbeam_channel::Receiver<()>>>,
    drained_mutex: Mutex<()>,
    drained_cv: Condvar,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Arc<dyn SessionCryptoProvider>,
        interactions: Arc<dyn InteractionStore>,
        dispatch: Arc<dyn MessageDispatch>,
        oracle: Arc<dyn RecipientOracle>,
        groups: Arc<dyn GroupStateProvider>,
        content_handler: Arc<dyn ContentHandler>,
        storage: Arc<dyn StorageAdapter>,
        local: LocalIdentity,
        local_profile_key: Option<Vec<u8>>,
    ) -> Arc<Self> {
        let decryptor = Decryptor::new(
            crypto.clone(),
            interactions.clone(),
            dispatch,
            oracle.clone(),
            storage.clone(),
            local,
            local_profile_key,
            ThrottleLedger::new(),
        );
        let router = Router::new(crypto, interactions, oracle, groups.clone());
        let early = Arc::new(EarlyArrivalBuffer::new(storage.clone()));
        let (drain_tx, drain_rx) = crossbeam_channel::unbounded();

        Arc::new(Self {
            queue: IntakeQueue::new(),
            decryptor,
            router,
            early,
            content_handler,
            groups,
            storage,
            local,
            recently_processed: Mutex::new(RecentGuids::new()),
            processing_permitted: AtomicBool::new(true),
            memory_constrained: AtomicBool::new(false),
            is_draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            drain_tx,
            drain_rx: Mutex::new(Some(drain_rx)),
            drained_mutex: Mutex::new(()),
            drained_cv: Condvar::new(),
        })
    }

    /// Spawn the serialized drain worker and run the startup sweeps.
    pub fn start(self: &Arc<Self>) -> thread::JoinHandle<()> {
        if let Err(e) = self.early.sweep() {
            warn!("Early-arrival startup sweep failed: {}", e);
        }
        match self.decryptor.sweep_expired_placeholders() {
            Ok(_) => {}
            Err(e) => warn!("Placeholder startup sweep failed: {}", e),
        }

        let processor = self.clone();
        let drain_rx = self
            .drain_rx
            .lock()
            .unwrap()
            .take()
            .expect("drain worker already started");
        thread::spawn(move || {
            while drain_rx.recv().is_ok() {
                if processor.stopped.load(Ordering::SeqCst) {
                    break;
                }
                processor.drain()
            }
        })
    }

    /// Stop the drain worker. Queued envelopes stay queued; their
    /// completions resolve as abandoned when the queue is dropped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.drain_tx.send(());
    }

    pub fn early_buffer(&self) -> &Arc<EarlyArrivalBuffer> {
        &self.early
    }

    /// Parse and enqueue one raw envelope. The returned completion
    /// resolves when the envelope has been durably processed (or
    /// rejected).
    pub fn process_encrypted_envelope_data(
        &self,
        data: &[u8],
        server_delivery_timestamp: u64,
        source: EnvelopeSource,
    ) -> Completion {
        if data.is_empty() {
            error!(source = %source, "Empty envelope");
            return resolved(Some(Error::InvalidEnvelope("Empty envelope".to_string())));
        }
        match Envelope::from_json_bytes(data) {
            Ok(envelope) => self.process_encrypted_envelope(envelope, server_delivery_timestamp, source),
            Err(e) => {
                error!(source = %source, "Failed to parse envelope: {}", e);
                resolved(Some(e))
            }
        }
    }

    pub fn process_encrypted_envelope(
        &self,
        envelope: Envelope,
        server_delivery_timestamp: u64,
        source: EnvelopeSource,
    ) -> Completion {
        if envelope.content.len() > MAX_ENVELOPE_BYTES {
            error!(source = %source, "Oversize envelope");
            return resolved(Some(Error::EnvelopeTooLarge(envelope.content.len())));
        }

        let (handle, completion) = completion_pair();
        self.queue.enqueue(PendingEnvelope::Encrypted {
            envelope,
            server_delivery_timestamp,
            source,
            completion: handle,
        });
        self.wake();
        completion
    }

    /// Enqueue an already-decrypted envelope (legacy sources, group-queue
    /// and early-arrival replay). Always accepted; assumed deduplicated
    /// upstream.
    pub fn process_decrypted_envelope(
        &self,
        envelope: Envelope,
        plaintext: Vec<u8>,
        server_delivery_timestamp: u64,
        was_sealed_sender: bool,
    ) -> Completion {
        let Some(source) = envelope.source else {
            return resolved(Some(Error::InvalidEnvelope(
                "Decrypted envelope is missing a source".to_string(),
            )));
        };

        let (handle, completion) = completion_pair();
        self.queue.enqueue(PendingEnvelope::Decrypted {
            envelope: DecryptedEnvelope {
                envelope,
                source,
                plaintext,
                was_sealed_sender,
                plaintext_cipher: false,
                server_delivery_timestamp,
            },
            completion: handle,
        });
        self.wake();
        completion
    }

    pub fn queued_content_count(&self) -> usize {
        self.queue.count()
    }

    pub fn has_pending_envelopes(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Gate for batch draining. Pausing stops after the current combined
    /// unit; un-pausing replays from the queue head.
    pub fn set_processing_permitted(&self, permitted: bool) {
        self.processing_permitted.store(permitted, Ordering::SeqCst);
        if permitted {
            self.wake();
        }
    }

    /// Shrink batches to one envelope while memory constrained.
    pub fn set_memory_constrained(&self, constrained: bool) {
        self.memory_constrained.store(constrained, Ordering::SeqCst);
    }

    /// Block until everything currently queued has been processed.
    pub fn wait_until_drained(&self) {
        let mut guard = self.drained_mutex.lock().unwrap();
        while !self.queue.is_empty() || self.is_draining.load(Ordering::SeqCst) {
            guard = self.drained_cv.wait(guard).unwrap();
        }
    }

    /// Replay everything parked for a freshly materialized message.
    /// Buffered envelopes re-enter the intake queue; buffered receipts go
    /// to `on_receipt`, which applies them to the new message.
    pub fn apply_pending_messages(
        &self,
        key: DependencyKey,
        tx: &WriteScope,
        on_receipt: &mut dyn FnMut(EarlyReceipt),
    ) -> Result<usize> {
        self.early.apply_pending(key, tx, &mut |item| match item {
            EarlyItem::Receipt(receipt) => on_receipt(receipt),
            EarlyItem::Envelope(buffered) => {
                let _ = self.process_decrypted_envelope(
                    buffered.envelope,
                    buffered.plaintext,
                    buffered.server_delivery_timestamp,
                    buffered.was_sealed_sender,
                );
            }
        })
    }

    fn wake(&self) {
        if self.processing_permitted.load(Ordering::SeqCst) {
            let _ = self.drain_tx.send(());
        }
    }

    fn drain(&self) {
        self.is_draining.store(true, Ordering::SeqCst);
        while self.drain_next_batch() {}
        self.is_draining.store(false, Ordering::SeqCst);

        if self.queue.is_empty() {
            // The queue fully drained: new failures may reset sessions
            // again.
            self.decryptor.end_batch();
        }
        let _guard = self.drained_mutex.lock().unwrap();
        self.drained_cv.notify_all();
    }

    /// Process one batch. Returns whether draining should continue.
    pub(crate) fn drain_next_batch(&self) -> bool {
        if !self.processing_permitted.load(Ordering::SeqCst) {
            return false;
        }

        let batch_size = if self.memory_constrained.load(Ordering::SeqCst) {
            CONSTRAINED_BATCH_SIZE
        } else {
            INCOMING_BATCH_SIZE
        };
        let batch = self.queue.next_batch(batch_size);
        if batch.envelopes.is_empty() {
            return false;
        }
        self.recently_processed
            .lock()
            .unwrap()
            .grow_limit(batch.total_pending);

        let started = now_ms();
        let mut processed = 0;
        while processed < batch.envelopes.len() {
            if !self.processing_permitted.load(Ordering::SeqCst) {
                break;
            }

            let scope = WriteScope::new(self.storage.clone());
            let unit = self.build_next_combined(&batch.envelopes[processed..], &scope);
            let unit_len = unit.len();
            self.handle_combined(unit, &scope);

            if let Err(e) = scope.commit() {
                // Nothing from this unit was applied; leave it queued and
                // retry from the front on the next drain.
                error!("Failed to commit batch unit: {}", e);
                break;
            }
            processed += unit_len;
        }

        {
            let mut recent = self.recently_processed.lock().unwrap();
            for pending in &batch.envelopes[..processed] {
                if let Some(guid) = pending.server_guid() {
                    recent.push(guid.to_string());
                }
            }
        }
        self.queue.remove_processed(processed);
        info!(
            processed,
            total = batch.total_pending,
            elapsed_ms = now_ms().saturating_sub(started),
            "Processed envelope batch"
        );
        processed > 0
    }

    /// Take envelopes off the front of `remaining` into one combined
    /// unit: consecutive delivery receipts plus the first non-receipt
    /// request, which terminates the run. Handling a non-receipt
    /// immediately keeps large decrypted envelopes out of memory.
    fn build_next_combined(
        &self,
        remaining: &[PendingEnvelope],
        tx: &WriteScope,
    ) -> Vec<(PendingEnvelope, ProcessingState)> {
        let mut unit = Vec::new();
        let mut flags = Vec::new();
        for pending in remaining {
            let state = self.processing_state_for(pending, tx);
            let is_delivery_receipt = state.delivery_receipt_timestamps().is_some();
            unit.push((pending.clone(), state));
            flags.push(is_delivery_receipt);
            if !is_delivery_receipt {
                break;
            }
        }
        debug_assert_eq!(
            crate::router::coalesce_delivery_runs(&flags).first(),
            Some(&(0..unit.len())),
            "combined unit must be one coalescing run"
        );
        unit
    }

    fn processing_state_for(&self, pending: &PendingEnvelope, tx: &WriteScope) -> ProcessingState {
        // Guid-based dedup applies to encrypted envelopes only, like the
        // queue-level scan: re-injected decrypted envelopes are assumed
        // already unique upstream (see DESIGN.md).
        if matches!(pending, PendingEnvelope::Encrypted { .. }) {
            if let Some(guid) = pending.server_guid() {
                if self.recently_processed.lock().unwrap().contains(guid) {
                    info!(guid, "Skipping envelope, recently processed");
                    return ProcessingState::Completed(Some(Error::DuplicateEnvelope));
                }
            }
        }

        match pending {
            PendingEnvelope::Encrypted {
                envelope,
                server_delivery_timestamp,
                ..
            } => match envelope.kind {
                EnvelopeKind::Receipt => {
                    if envelope.source.is_none() {
                        return ProcessingState::Completed(Some(Error::InvalidEnvelope(
                            "Server receipt is missing a source".to_string(),
                        )));
                    }
                    ProcessingState::ServerReceipt(envelope.clone())
                }
                EnvelopeKind::KeyExchange => {
                    info!("Ignoring legacy key exchange envelope");
                    ProcessingState::Completed(None)
                }
                EnvelopeKind::Unknown => {
                    warn!("Dropping envelope with unknown type");
                    ProcessingState::Completed(Some(Error::InvalidEnvelope(
                        "Unknown envelope type".to_string(),
                    )))
                }
                _ => match self
                    .decryptor
                    .decrypt(envelope, *server_delivery_timestamp, tx)
                {
                    Ok(decrypted) => self.classify(decrypted, tx),
                    Err(e) => ProcessingState::Completed(Some(e)),
                },
            },
            PendingEnvelope::Decrypted { envelope, .. } => self.classify(envelope.clone(), tx),
        }
    }

    fn classify(&self, decrypted: DecryptedEnvelope, tx: &WriteScope) -> ProcessingState {
        match self.router.classify(decrypted, tx) {
            Ok(state) => state,
            Err(e) => ProcessingState::Completed(Some(e)),
        }
    }

    /// Execute one combined unit inside its write scope. Delivery
    /// receipts across the unit resolve through a single multi-timestamp
    /// lookup before the per-request side effects run.
    fn handle_combined(&self, unit: Vec<(PendingEnvelope, ProcessingState)>, tx: &WriteScope) {
        self.record_coalesced_delivery_receipts(&unit, tx);

        for (pending, state) in unit {
            let outcome = self.execute_state(state, tx);
            let completion = pending.completion().clone();
            tx.add_completion(move || completion.resolve(outcome));
        }
    }

    fn record_coalesced_delivery_receipts(
        &self,
        unit: &[(PendingEnvelope, ProcessingState)],
        tx: &WriteScope,
    ) {
        let mut lookups: Vec<(ProtocolAddress, Vec<u64>)> = Vec::new();
        for (_, state) in unit {
            let Some(timestamps) = state.delivery_receipt_timestamps() else {
                continue;
            };
            let recipient = match state {
                ProcessingState::ServerReceipt(envelope) => match envelope.source {
                    Some(source) => source,
                    None => continue,
                },
                ProcessingState::Deliverable(request) => request.decrypted.source,
                _ => continue,
            };
            match lookups.iter_mut().find(|(address, _)| *address == recipient) {
                Some((_, existing)) => existing.extend(timestamps),
                None => lookups.push((recipient, timestamps)),
            }
        }

        let delivered_at = now_ms();
        for (recipient, timestamps) in lookups {
            match self.router.record_delivery_receipts(recipient, &timestamps, delivered_at, tx) {
                Ok(unmatched) => {
                    for timestamp in unmatched {
                        let receipt = EarlyReceipt::OutgoingMessageDelivered {
                            sender: recipient,
                            at: delivered_at,
                        };
                        let key = DependencyKey::new(timestamp, self.local.account);
                        if let Err(e) = self.early.record_early_receipt(receipt, key, tx) {
                            warn!("Failed to buffer early delivery receipt: {}", e);
                        }
                    }
                }
                Err(e) => warn!("Failed to record delivery receipts: {}", e),
            }
        }
    }

    fn execute_state(&self, state: ProcessingState, tx: &WriteScope) -> Option<Error> {
        match state {
            ProcessingState::Completed(error) => {
                if let Some(e) = &error {
                    info!("Envelope completed early: {}", e);
                }
                error
            }
            ProcessingState::DeferForGroup {
                envelope,
                serialized,
            } => match self.groups.enqueue_for_group(&envelope, &serialized, tx) {
                Ok(()) => None,
                Err(e) => Some(e),
            },
            ProcessingState::ServerReceipt(_) => {
                // Already resolved by the coalesced lookup.
                None
            }
            ProcessingState::Deliverable(request) => {
                let outcome = if request.content.delivery_receipt_timestamps().is_some() {
                    // Already resolved by the coalesced lookup.
                    Ok(HandlerOutcome::Handled)
                } else {
                    self.content_handler.handle(&request, tx)
                };

                let error = match outcome {
                    Ok(HandlerOutcome::Handled) => None,
                    Ok(HandlerOutcome::MissingDependency(key)) => {
                        self.buffer_early_envelope(&request.decrypted, key, tx);
                        None
                    }
                    Err(e) => {
                        warn!(
                            timestamp = request.decrypted.envelope.timestamp,
                            "Content handler failed: {}", e
                        );
                        Some(e)
                    }
                };

                if let Err(e) = self.router.finish_processing(&request.decrypted, tx) {
                    warn!("Finish bookkeeping failed: {}", e);
                }
                error
            }
            ProcessingState::ClearPlaceholder(decrypted) => {
                if let Err(e) = self.router.finish_processing(&decrypted, tx) {
                    warn!("Finish bookkeeping failed: {}", e);
                }
                None
            }
        }
    }

    fn buffer_early_envelope(&self, decrypted: &DecryptedEnvelope, key: DependencyKey, tx: &WriteScope) {
        debug!(
            target_timestamp = key.timestamp,
            "Buffering envelope until its dependency materializes"
        );
        let buffered = BufferedEnvelope {
            envelope: decrypted.envelope.clone(),
            plaintext: decrypted.plaintext.clone(),
            was_sealed_sender: decrypted.was_sealed_sender,
            server_delivery_timestamp: decrypted.server_delivery_timestamp,
        };
        if let Err(e) = self.early.record_early_envelope(buffered, key, tx) {
            warn!("Failed to buffer early envelope: {}", e);
        }
    }
}

fn resolved(outcome: Option<Error>) -> Completion {
    let (handle, completion) = completion_pair();
    handle.resolve(outcome);
    completion
}
