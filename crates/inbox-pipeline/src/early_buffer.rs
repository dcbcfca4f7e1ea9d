use crate::envelope::{serde_base64, Envelope};
use crate::storage::{StorageAdapter, WriteScope};
use crate::types::{DependencyKey, ProtocolAddress, EARLY_ENTRY_CAP, EARLY_ENVELOPE_MAX_BYTES, EARLY_HORIZON_MS};
use crate::utils::now_ms;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const EARLY_PREFIX: &str = "early/";
const DEDUP_MIGRATION_FLAG: &str = "flags/early-dedup-v1";

/// A receipt that arrived before the message it refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EarlyReceipt {
    OutgoingMessageRead { sender: ProtocolAddress, at: u64 },
    OutgoingMessageDelivered { sender: ProtocolAddress, at: u64 },
    OutgoingMessageViewed { sender: ProtocolAddress, at: u64 },
    LinkedDeviceRead { at: u64 },
    LinkedDeviceViewed { at: u64 },
}

/// A decrypted envelope parked until its dependency materializes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedEnvelope {
    pub envelope: Envelope,
    #[serde(with = "serde_base64")]
    pub plaintext: Vec<u8>,
    pub was_sealed_sender: bool,
    pub server_delivery_timestamp: u64,
}

#[derive(Debug)]
pub enum EarlyItem {
    Receipt(EarlyReceipt),
    Envelope(BufferedEnvelope),
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarlyStore {
    receipts: Vec<EarlyReceipt>,
    envelopes: Vec<BufferedEnvelope>,
}

/// Persists receipts and envelopes whose (timestamp, author) target has
/// no materialized interaction yet, replays them once the target appears,
/// and evicts stale or excess entries.
pub struct EarlyArrivalBuffer {
    storage: Arc<dyn StorageAdapter>,
}

impl EarlyArrivalBuffer {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    fn storage_key(key: &DependencyKey) -> String {
        format!("{}{:020}/{}", EARLY_PREFIX, key.timestamp, key.author.to_hex())
    }

    fn timestamp_of_key(storage_key: &str) -> Option<u64> {
        storage_key
            .strip_prefix(EARLY_PREFIX)?
            .split('/')
            .next()?
            .parse()
            .ok()
    }

    fn load(&self, key: &DependencyKey, tx: &WriteScope) -> Result<EarlyStore> {
        match tx.get(&Self::storage_key(key))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(EarlyStore::default()),
        }
    }

    fn save(&self, key: &DependencyKey, store: &EarlyStore, tx: &WriteScope) -> Result<()> {
        tx.put(&Self::storage_key(key), serde_json::to_string(store)?);
        Ok(())
    }

    /// Buffer a decrypted envelope until `key` materializes. Envelopes
    /// whose serialized form exceeds the per-entry byte cap are rejected,
    /// never buffered.
    pub fn record_early_envelope(
        &self,
        buffered: BufferedEnvelope,
        key: DependencyKey,
        tx: &WriteScope,
    ) -> Result<()> {
        let serialized_len = buffered.envelope.to_json()?.len();
        if serialized_len > EARLY_ENVELOPE_MAX_BYTES {
            warn!(
                bytes = serialized_len,
                timestamp = key.timestamp,
                "Refusing to buffer oversize early envelope"
            );
            return Err(Error::EnvelopeTooLarge(serialized_len));
        }

        let mut store = self.load(&key, tx)?;
        store.envelopes.push(buffered);
        if store.envelopes.len() > EARLY_ENTRY_CAP {
            let excess = store.envelopes.len() - EARLY_ENTRY_CAP;
            store.envelopes.drain(..excess);
            debug!(
                timestamp = key.timestamp,
                evicted = excess,
                "Evicted oldest early envelopes at cap"
            );
        }
        self.save(&key, &store, tx)
    }

    /// Buffer a receipt until `key` materializes. Re-recording a receipt
    /// that already exists by value is a silent no-op.
    pub fn record_early_receipt(
        &self,
        receipt: EarlyReceipt,
        key: DependencyKey,
        tx: &WriteScope,
    ) -> Result<()> {
        let mut store = self.load(&key, tx)?;
        if store.receipts.contains(&receipt) {
            return Ok(());
        }
        store.receipts.push(receipt);
        if store.receipts.len() > EARLY_ENTRY_CAP {
            let excess = store.receipts.len() - EARLY_ENTRY_CAP;
            store.receipts.drain(..excess);
        }
        self.save(&key, &store, tx)
    }

    /// Atomically pop everything buffered for `key` — receipts first,
    /// then envelopes — hand each to `replay`, and delete the key's
    /// storage. Entries are never left partially applied.
    pub fn apply_pending(
        &self,
        key: DependencyKey,
        tx: &WriteScope,
        replay: &mut dyn FnMut(EarlyItem),
    ) -> Result<usize> {
        let store = self.load(&key, tx)?;
        tx.del(&Self::storage_key(&key));

        let mut replayed = 0;
        for receipt in store.receipts {
            replay(EarlyItem::Receipt(receipt));
            replayed += 1;
        }
        for envelope in store.envelopes {
            replay(EarlyItem::Envelope(envelope));
            replayed += 1;
        }
        if replayed > 0 {
            info!(
                timestamp = key.timestamp,
                author = %key.author,
                replayed,
                "Applied early-arrival entries"
            );
        }
        Ok(replayed)
    }

    /// Remove keys older than the retention horizon, and — once, after
    /// install — dedup and cap lists persisted before the caps existed.
    /// Runs at process start and opportunistically afterwards.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(now_ms())
    }

    fn sweep_at(&self, now: u64) -> Result<usize> {
        let scope = WriteScope::new(self.storage.clone());
        let cutoff = now.saturating_sub(EARLY_HORIZON_MS);
        let mut removed = 0;

        let keys = scope.list(EARLY_PREFIX)?;
        let run_migration = scope.get(DEDUP_MIGRATION_FLAG)?.is_none();

        for storage_key in keys {
            let Some(timestamp) = Self::timestamp_of_key(&storage_key) else {
                warn!(key = %storage_key, "Removing unparseable early-arrival key");
                scope.del(&storage_key);
                continue;
            };

            if timestamp < cutoff {
                scope.del(&storage_key);
                removed += 1;
                continue;
            }

            if run_migration {
                let Some(raw) = scope.get(&storage_key)? else {
                    continue;
                };
                let Ok(mut store) = serde_json::from_str::<EarlyStore>(&raw) else {
                    scope.del(&storage_key);
                    continue;
                };
                let mut deduped: Vec<EarlyReceipt> = Vec::new();
                for receipt in store.receipts {
                    if !deduped.contains(&receipt) {
                        deduped.push(receipt);
                    }
                }
                store.receipts = deduped;
                if store.receipts.len() > EARLY_ENTRY_CAP {
                    let excess = store.receipts.len() - EARLY_ENTRY_CAP;
                    store.receipts.drain(..excess);
                }
                if store.envelopes.len() > EARLY_ENTRY_CAP {
                    let excess = store.envelopes.len() - EARLY_ENTRY_CAP;
                    store.envelopes.drain(..excess);
                }
                scope.put(&storage_key, serde_json::to_string(&store)?);
            }
        }

        if run_migration {
            scope.put(DEDUP_MIGRATION_FLAG, "1".to_string());
        }

        scope.commit()?;
        if removed > 0 {
            info!(removed, "Swept stale early-arrival entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::storage::InMemoryStorage;
    use crate::types::{AccountId, DeviceId};

    fn buffer() -> (EarlyArrivalBuffer, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        (EarlyArrivalBuffer::new(storage.clone()), storage)
    }

    fn dep_key(timestamp: u64) -> DependencyKey {
        DependencyKey::new(timestamp, AccountId([9u8; 32]))
    }

    fn buffered(timestamp: u64, content_len: usize) -> BufferedEnvelope {
        BufferedEnvelope {
            envelope: Envelope {
                server_guid: Some(format!("guid-{}", timestamp)),
                source: Some(ProtocolAddress::new(AccountId([1u8; 32]), DeviceId(1))),
                timestamp,
                server_timestamp: timestamp,
                content: vec![0u8; content_len],
                kind: EnvelopeKind::Ciphertext,
                reporting_token: None,
            },
            plaintext: vec![1, 2],
            was_sealed_sender: false,
            server_delivery_timestamp: timestamp,
        }
    }

    fn read_receipt(at: u64) -> EarlyReceipt {
        EarlyReceipt::OutgoingMessageRead {
            sender: ProtocolAddress::new(AccountId([2u8; 32]), DeviceId(1)),
            at,
        }
    }

    #[test]
    fn round_trip_replays_receipts_then_envelopes_and_clears() {
        let (buffer, storage) = buffer();
        let key = dep_key(1000);
        let tx = WriteScope::new(storage.clone());

        buffer.record_early_envelope(buffered(1, 4), key, &tx).unwrap();
        buffer.record_early_receipt(read_receipt(5), key, &tx).unwrap();
        tx.commit().unwrap();

        let tx = WriteScope::new(storage.clone());
        let mut seen = Vec::new();
        let replayed = buffer
            .apply_pending(key, &tx, &mut |item| {
                seen.push(matches!(item, EarlyItem::Receipt(_)));
            })
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(replayed, 2);
        assert_eq!(seen, vec![true, false]);
        assert!(storage.list("early/").unwrap().is_empty());
    }

    #[test]
    fn receipt_recorded_twice_is_stored_once() {
        let (buffer, storage) = buffer();
        let key = dep_key(1000);
        let tx = WriteScope::new(storage.clone());

        buffer.record_early_receipt(read_receipt(5), key, &tx).unwrap();
        buffer.record_early_receipt(read_receipt(5), key, &tx).unwrap();
        tx.commit().unwrap();

        let tx = WriteScope::new(storage);
        let mut count = 0;
        buffer.apply_pending(key, &tx, &mut |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn envelope_cap_keeps_most_recent() {
        let (buffer, storage) = buffer();
        let key = dep_key(1000);
        let tx = WriteScope::new(storage.clone());

        for i in 0..200 {
            buffer.record_early_envelope(buffered(i, 4), key, &tx).unwrap();
        }
        tx.commit().unwrap();

        let tx = WriteScope::new(storage);
        let mut timestamps = Vec::new();
        buffer
            .apply_pending(key, &tx, &mut |item| {
                if let EarlyItem::Envelope(buffered) = item {
                    timestamps.push(buffered.envelope.timestamp);
                }
            })
            .unwrap();

        assert_eq!(timestamps.len(), EARLY_ENTRY_CAP);
        assert_eq!(timestamps.first(), Some(&72));
        assert_eq!(timestamps.last(), Some(&199));
    }

    #[test]
    fn oversize_envelope_is_rejected() {
        let (buffer, storage) = buffer();
        let tx = WriteScope::new(storage);
        let result = buffer.record_early_envelope(buffered(1, 2000), dep_key(1000), &tx);
        assert!(matches!(result, Err(Error::EnvelopeTooLarge(_))));
    }

    #[test]
    fn sweep_removes_stale_keys_only() {
        let (buffer, storage) = buffer();
        let now = 10 * EARLY_HORIZON_MS;
        let stale = dep_key(now - EARLY_HORIZON_MS - 1);
        let fresh = dep_key(now - 1000);

        let tx = WriteScope::new(storage.clone());
        buffer.record_early_receipt(read_receipt(1), stale, &tx).unwrap();
        buffer.record_early_receipt(read_receipt(2), fresh, &tx).unwrap();
        tx.commit().unwrap();

        let removed = buffer.sweep_at(now).unwrap();
        assert_eq!(removed, 1);

        let remaining = storage.list("early/").unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].contains(&format!("{:020}", fresh.timestamp)));
    }

    #[test]
    fn first_sweep_dedups_preexisting_lists() {
        let (buffer, storage) = buffer();
        let now = 10 * EARLY_HORIZON_MS;
        let key = dep_key(now - 1000);

        // Simulate entries persisted before the caps existed.
        let store = EarlyStore {
            receipts: vec![read_receipt(1), read_receipt(1), read_receipt(2)],
            envelopes: Vec::new(),
        };
        storage
            .put(
                &EarlyArrivalBuffer::storage_key(&key),
                serde_json::to_string(&store).unwrap(),
            )
            .unwrap();

        buffer.sweep_at(now).unwrap();

        let tx = WriteScope::new(storage.clone());
        let mut count = 0;
        buffer.apply_pending(key, &tx, &mut |_| count += 1).unwrap();
        assert_eq!(count, 2);

        // Migration runs once.
        assert!(storage.get(DEDUP_MIGRATION_FLAG).unwrap().is_some());
    }
}
