use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.store.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.store.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

enum StagedOp {
    Put(String, String),
    Del(String),
}

/// One atomic write scope.
///
/// Everything a batch item does — persisting the decryption result,
/// routing side effects, throttle ledger updates — is staged here and
/// applied to the backing store in one `commit`. Reads see staged writes.
/// Completion callbacks registered on the scope run only after the staged
/// ops have been applied, so callers never observe a half-committed item.
pub struct WriteScope {
    storage: Arc<dyn StorageAdapter>,
    staged: Mutex<Vec<StagedOp>>,
    completions: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl WriteScope {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            staged: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let staged = self.staged.lock().unwrap();
        for op in staged.iter().rev() {
            match op {
                StagedOp::Put(k, v) if k == key => return Ok(Some(v.clone())),
                StagedOp::Del(k) if k == key => return Ok(None),
                _ => {}
            }
        }
        drop(staged);
        self.storage.get(key)
    }

    pub fn put(&self, key: &str, value: String) {
        self.staged
            .lock()
            .unwrap()
            .push(StagedOp::Put(key.to_string(), value));
    }

    pub fn del(&self, key: &str) {
        self.staged
            .lock()
            .unwrap()
            .push(StagedOp::Del(key.to_string()));
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self.storage.list(prefix)?;
        let staged = self.staged.lock().unwrap();
        for op in staged.iter() {
            match op {
                StagedOp::Put(k, _) if k.starts_with(prefix) && !keys.contains(k) => {
                    keys.push(k.clone());
                }
                StagedOp::Del(k) => {
                    keys.retain(|existing| existing != k);
                }
                _ => {}
            }
        }
        Ok(keys)
    }

    /// Run `f` after the scope commits. Used to resolve envelope
    /// completions and to hand messages to the outgoing queue only once
    /// their originating side effects are durable.
    pub fn add_completion(&self, f: impl FnOnce() + Send + 'static) {
        self.completions.lock().unwrap().push(Box::new(f));
    }

    pub fn commit(self) -> Result<()> {
        let WriteScope {
            storage,
            staged,
            completions,
        } = self;
        for op in staged.into_inner().unwrap() {
            match op {
                StagedOp::Put(k, v) => storage.put(&k, v)?,
                StagedOp::Del(k) => storage.del(&k)?,
            }
        }
        for completion in completions.into_inner().unwrap() {
            completion();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let storage = Arc::new(InMemoryStorage::new());
        let scope = WriteScope::new(storage.clone());

        scope.put("k", "v".to_string());
        assert_eq!(scope.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(storage.get("k").unwrap(), None);

        scope.commit().unwrap();
        assert_eq!(storage.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn read_through_sees_latest_staged_op() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.put("k", "old".to_string()).unwrap();

        let scope = WriteScope::new(storage.clone());
        scope.put("k", "new".to_string());
        scope.del("k");
        assert_eq!(scope.get("k").unwrap(), None);

        scope.put("k", "newer".to_string());
        assert_eq!(scope.get("k").unwrap(), Some("newer".to_string()));
    }

    #[test]
    fn completions_run_after_ops_apply() {
        let storage = Arc::new(InMemoryStorage::new());
        let scope = WriteScope::new(storage.clone());
        let seen = Arc::new(Mutex::new(None));

        scope.put("k", "v".to_string());
        let seen_clone = seen.clone();
        let storage_clone = storage.clone();
        scope.add_completion(move || {
            *seen_clone.lock().unwrap() = storage_clone.get("k").unwrap();
        });

        scope.commit().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some("v".to_string()));
    }

    #[test]
    fn list_merges_staged_and_stored_keys() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.put("p/a", "1".to_string()).unwrap();
        storage.put("p/b", "2".to_string()).unwrap();

        let scope = WriteScope::new(storage);
        scope.put("p/c", "3".to_string());
        scope.del("p/b");

        let mut keys = scope.list("p/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p/a".to_string(), "p/c".to_string()]);
    }
}
