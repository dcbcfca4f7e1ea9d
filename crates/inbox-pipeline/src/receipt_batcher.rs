use crate::content::ReceiptKind;
use crate::dispatch::{MessageDispatch, SendError};
use crate::oracle::RecipientOracle;
use crate::storage::{StorageAdapter, WriteScope};
use crate::tasks::{PendingTasks, TaskGuard};
use crate::types::{AccountId, RECEIPT_FLUSH_INTERVAL_MS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECEIPT_PREFIX: &str = "receipts/";

/// Pending acknowledgements for one (destination, kind): sent-message
/// timestamps, each with an optional target message id. A non-empty set
/// always means a send is outstanding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSet {
    pub entries: BTreeMap<u64, Option<String>>,
}

impl ReceiptSet {
    pub fn insert(&mut self, timestamp: u64, message_id: Option<String>) {
        self.entries.entry(timestamp).or_insert(message_id);
    }

    pub fn remove_all(&mut self, timestamps: impl IntoIterator<Item = u64>) {
        for timestamp in timestamps {
            self.entries.remove(&timestamp);
        }
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Guards a single concurrent flush cycle.
#[derive(Default)]
struct SendingState {
    in_progress: bool,
    might_have_pending: bool,
}

/// Accumulates outgoing delivery/read/viewed acknowledgements per
/// destination and kind, persists them immediately, and flushes them as
/// batched sends with per-destination retry and at-least-once semantics.
pub struct ReceiptBatcher {
    storage: Arc<dyn StorageAdapter>,
    dispatch: Arc<dyn MessageDispatch>,
    oracle: Arc<dyn RecipientOracle>,
    state: Arc<Mutex<SendingState>>,
    pending_tasks: PendingTasks,
    wake_tx: crossbeam_channel::Sender<()>,
    wake_rx: Mutex<Option<crossbeam_channel::Receiver<()>>>,
    stopped: AtomicBool,
}

impl ReceiptBatcher {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        dispatch: Arc<dyn MessageDispatch>,
        oracle: Arc<dyn RecipientOracle>,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            storage,
            dispatch,
            oracle,
            state: Arc::new(Mutex::new(SendingState::default())),
            pending_tasks: PendingTasks::new(),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    fn receipt_key(kind: ReceiptKind, destination: &AccountId) -> String {
        format!("{}{}/{}", RECEIPT_PREFIX, kind.as_str(), destination.to_hex())
    }

    fn parse_key(key: &str) -> Option<(ReceiptKind, AccountId)> {
        let rest = key.strip_prefix(RECEIPT_PREFIX)?;
        let (kind_str, destination_hex) = rest.split_once('/')?;
        let kind = ReceiptKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == kind_str)?;
        let destination = AccountId::from_hex(destination_hex).ok()?;
        Some((kind, destination))
    }

    /// Merge one acknowledgement into the destination's pending set. The
    /// merge persists in the caller's write scope, so the acknowledgement
    /// survives a crash before the batch flush.
    pub fn enqueue(
        &self,
        destination: AccountId,
        timestamp: u64,
        message_id: Option<String>,
        kind: ReceiptKind,
        tx: &WriteScope,
    ) -> Result<()> {
        let key = Self::receipt_key(kind, &destination);
        let mut set: ReceiptSet = match tx.get(&key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => ReceiptSet::default(),
        };
        set.insert(timestamp, message_id);
        tx.put(&key, serde_json::to_string(&set)?);

        let state = self.state.clone();
        let wake = self.wake_tx.clone();
        tx.add_completion(move || {
            state.lock().unwrap().might_have_pending = true;
            let _ = wake.send(());
        });
        Ok(())
    }

    pub fn enqueue_delivery_receipt(
        &self,
        destination: AccountId,
        timestamp: u64,
        message_id: Option<String>,
        tx: &WriteScope,
    ) -> Result<()> {
        self.enqueue(destination, timestamp, message_id, ReceiptKind::Delivery, tx)
    }

    pub fn enqueue_read_receipt(
        &self,
        destination: AccountId,
        timestamp: u64,
        message_id: Option<String>,
        tx: &WriteScope,
    ) -> Result<()> {
        self.enqueue(destination, timestamp, message_id, ReceiptKind::Read, tx)
    }

    pub fn enqueue_viewed_receipt(
        &self,
        destination: AccountId,
        timestamp: u64,
        message_id: Option<String>,
        tx: &WriteScope,
    ) -> Result<()> {
        self.enqueue(destination, timestamp, message_id, ReceiptKind::Viewed, tx)
    }

    /// Spawn the background flush loop.
    pub fn start(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let batcher = self.clone();
        let wake_rx = self
            .wake_rx
            .lock()
            .unwrap()
            .take()
            .expect("flush loop already started");
        thread::spawn(move || {
            while wake_rx.recv().is_ok() {
                if batcher.stopped.load(Ordering::SeqCst) {
                    break;
                }
                batcher.flush_if_needed();
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.send(());
    }

    /// Wait for every flush send in flight at the time of the call.
    /// Sends started afterwards are not waited on. Used to bound process
    /// lifetime at shutdown.
    pub fn wait_for_pending_sends(&self) {
        self.pending_tasks.wait_for_pending();
    }

    fn flush_if_needed(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_progress {
                state.might_have_pending = true;
                return;
            }
            state.in_progress = true;
            state.might_have_pending = false;
        }

        loop {
            if let Err(e) = self.run_cycle() {
                warn!("Receipt flush cycle failed: {}", e);
            }

            let mut state = self.state.lock().unwrap();
            if state.might_have_pending && !self.stopped.load(Ordering::SeqCst) {
                state.might_have_pending = false;
                drop(state);
                // Let acknowledgements accumulate before the next send.
                thread::sleep(Duration::from_millis(RECEIPT_FLUSH_INTERVAL_MS));
                continue;
            }
            state.in_progress = false;
            break;
        }
    }

    /// One flush cycle: every kind, every destination within a kind, each
    /// sent as one batched acknowledgement message.
    pub fn run_cycle(&self) -> Result<()> {
        let _guard: TaskGuard = self.pending_tasks.start("receipt-flush-cycle");

        let mut targets = Vec::new();
        for key in self.storage.list(RECEIPT_PREFIX)? {
            if let Some(target) = Self::parse_key(&key) {
                targets.push(target);
            } else {
                warn!(key = %key, "Removing unparseable receipt key");
                self.storage.del(&key)?;
            }
        }

        if targets.is_empty() {
            return Ok(());
        }
        debug!(destinations = targets.len(), "Flushing pending receipt sets");

        let mut first_error = None;
        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|(kind, destination)| {
                    scope.spawn(move || self.flush_destination(*kind, *destination))
                })
                .collect();
            for handle in handles {
                if let Ok(Err(e)) = handle.join().map_err(|_| ()) {
                    first_error.get_or_insert(e);
                }
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush_destination(&self, kind: ReceiptKind, destination: AccountId) -> Result<()> {
        let key = Self::receipt_key(kind, &destination);
        let set: ReceiptSet = match self.storage.get(&key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => return Ok(()),
        };
        if set.is_empty() {
            self.storage.del(&key)?;
            return Ok(());
        }

        if self.oracle.is_blocked(&destination) || self.oracle.is_hidden(&destination) {
            info!(
                destination = %destination,
                kind = %kind,
                "Dropping receipts for blocked or hidden destination"
            );
            let scope = WriteScope::new(self.storage.clone());
            scope.del(&key);
            scope.commit()?;
            return Ok(());
        }

        match self.dispatch.send_receipts(destination, kind, &set) {
            Ok(()) => {
                // Clear exactly what was in flight; anything enqueued
                // meanwhile stays for its own send.
                let scope = WriteScope::new(self.storage.clone());
                let mut current: ReceiptSet = match scope.get(&key)? {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => ReceiptSet::default(),
                };
                current.remove_all(set.timestamps());
                if current.is_empty() {
                    scope.del(&key);
                } else {
                    scope.put(&key, serde_json::to_string(&current)?);
                }
                scope.commit()?;
                debug!(
                    destination = %destination,
                    kind = %kind,
                    sent = set.len(),
                    "Receipt batch sent"
                );
                Ok(())
            }
            Err(SendError::RecipientUnknown) => {
                warn!(
                    destination = %destination,
                    kind = %kind,
                    "Dropping receipts for unknown recipient"
                );
                let scope = WriteScope::new(self.storage.clone());
                scope.del(&key);
                scope.commit()?;
                Err(Error::RecipientUnknown)
            }
            Err(SendError::Transient(message)) => {
                warn!(
                    destination = %destination,
                    kind = %kind,
                    "Receipt send failed, keeping set for next cycle: {}",
                    message
                );
                self.state.lock().unwrap().might_have_pending = true;
                Ok(())
            }
        }
    }
}
