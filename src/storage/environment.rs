//! Environment and storage transactions

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::errors::{StorageError, StorageResult};

/// Encode a tuple id as an order-preserving key
pub fn tuple_key(tuple_id: u64) -> Vec<u8> {
    tuple_id.to_be_bytes().to_vec()
}

/// Decode a key produced by `tuple_key`
pub fn decode_tuple_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, Default)]
struct Store {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Version of the last commit that wrote each key. Entries of deleted
    /// keys are pruned once no live snapshot predates the delete.
    key_versions: HashMap<Vec<u8>, u64>,
    /// Version of the last commit that truncated the store
    truncated_at: u64,
    /// Version of the last commit that wrote to the store at all
    modified_at: u64,
}

impl Store {
    fn changed_since(&self, key: &[u8], version: u64) -> bool {
        self.truncated_at > version
            || self
                .key_versions
                .get(key)
                .map(|v| *v > version)
                .unwrap_or(false)
    }

    fn modified_since(&self, version: u64) -> bool {
        self.modified_at > version || self.truncated_at > version
    }
}

/// A key deleted by the commit of `version`
#[derive(Debug)]
struct Tombstone {
    version: u64,
    store: String,
    key: Vec<u8>,
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    stores: HashMap<String, Arc<Store>>,
    /// Deletes whose key versions are still tracked, oldest first
    tombstones: VecDeque<Tombstone>,
}

impl Committed {
    /// Forget the versions of deleted keys that no snapshot at or after
    /// `oldest_snapshot` can conflict with
    fn prune_tombstones(&mut self, oldest_snapshot: u64) {
        while self
            .tombstones
            .front()
            .is_some_and(|t| t.version <= oldest_snapshot)
        {
            let Some(tombstone) = self.tombstones.pop_front() else {
                break;
            };
            let Some(slot) = self.stores.get_mut(&tombstone.store) else {
                continue;
            };
            let deleted = !slot.entries.contains_key(&tombstone.key)
                && slot.key_versions.get(&tombstone.key) == Some(&tombstone.version);
            if deleted {
                Arc::make_mut(slot).key_versions.remove(&tombstone.key);
            }
        }
    }
}

/// The storage environment shared by all transactions
#[derive(Debug, Default)]
pub struct Environment {
    state: RwLock<Committed>,
    /// Open snapshots per version
    snapshots: Mutex<BTreeMap<u64, usize>>,
    closed: AtomicBool,
}

impl Environment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a storage transaction on the latest committed snapshot
    pub fn begin(self: &Arc<Self>, read_only: bool) -> StorageResult<StorageTx> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let state = self.state.read();
        *self.snapshots.lock().entry(state.version).or_insert(0) += 1;
        Ok(StorageTx {
            env: Arc::clone(self),
            read_only,
            snapshot_version: state.version,
            snapshot: state.stores.clone(),
            writes: BTreeMap::new(),
            reads: HashSet::new(),
            scanned: HashSet::new(),
            finished: false,
            registered: true,
        })
    }

    /// Version of the latest commit
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Refuse new transactions; open ones may still finish
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn oldest_snapshot(&self) -> Option<u64> {
        self.snapshots.lock().keys().next().copied()
    }

    fn release_snapshot(&self, version: u64) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&version);
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingStore {
    truncated: bool,
    /// `None` marks a delete
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// A storage transaction bound to one snapshot
#[derive(Debug)]
pub struct StorageTx {
    env: Arc<Environment>,
    read_only: bool,
    snapshot_version: u64,
    snapshot: HashMap<String, Arc<Store>>,
    writes: BTreeMap<String, PendingStore>,
    /// Point reads validated at commit
    reads: HashSet<(String, Vec<u8>)>,
    /// Scanned stores validated at commit
    scanned: HashSet<String>,
    finished: bool,
    /// The snapshot is still counted by the environment
    registered: bool,
}

impl StorageTx {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Version of the snapshot this transaction reads from
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// True while nothing was written
    pub fn is_idempotent(&self) -> bool {
        self.writes.is_empty()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.finished {
            Err(StorageError::Finished)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self, store: &str) -> StorageResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StorageError::ReadOnly {
                store: store.to_string(),
            });
        }
        Ok(())
    }

    /// Read one key
    pub fn get(&mut self, store: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(pending) = self.writes.get(store) {
            if let Some(value) = pending.entries.get(key) {
                return Ok(value.clone());
            }
            if pending.truncated {
                return Ok(None);
            }
        }
        if !self.read_only {
            self.reads.insert((store.to_string(), key.to_vec()));
        }
        Ok(self
            .snapshot
            .get(store)
            .and_then(|s| s.entries.get(key))
            .cloned())
    }

    pub fn put(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.ensure_writable(store)?;
        self.writes
            .entry(store.to_string())
            .or_default()
            .entries
            .insert(key, Some(value));
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: &[u8]) -> StorageResult<()> {
        self.ensure_writable(store)?;
        self.writes
            .entry(store.to_string())
            .or_default()
            .entries
            .insert(key.to_vec(), None);
        Ok(())
    }

    /// Remove every entry of a store
    pub fn truncate(&mut self, store: &str) -> StorageResult<()> {
        self.ensure_writable(store)?;
        self.writes.insert(
            store.to_string(),
            PendingStore {
                truncated: true,
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// All entries of a store in key order
    pub fn scan(&mut self, store: &str) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_range(store, Bound::Unbounded, Bound::Unbounded)
    }

    /// Entries with keys inside the given bounds, in key order.
    ///
    /// Writable transactions validate the whole store at commit.
    pub fn scan_range(
        &mut self,
        store: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        if !self.read_only {
            self.scanned.insert(store.to_string());
        }
        let pending = self.writes.get(store);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let truncated = pending.map(|p| p.truncated).unwrap_or(false);
        if !truncated {
            if let Some(base) = self.snapshot.get(store) {
                for (k, v) in base.entries.range::<[u8], _>((lower, upper)) {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        if let Some(pending) = pending {
            for (k, v) in pending.entries.range::<[u8], _>((lower, upper)) {
                match v {
                    Some(v) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    None => {
                        merged.remove(k);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Number of entries in a store
    pub fn count(&mut self, store: &str) -> StorageResult<usize> {
        Ok(self.scan(store)?.len())
    }

    /// Read and decode a JSON value
    pub fn get_json<T: DeserializeOwned>(
        &mut self,
        store: &str,
        key: &[u8],
    ) -> StorageResult<Option<T>> {
        match self.get(store, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    pub fn put_json<T: Serialize>(&mut self, store: &str, key: Vec<u8>, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(store, key, bytes)
    }

    /// Commit all buffered writes.
    ///
    /// Returns `Ok(false)` if another commit touched a written or point-read
    /// key, or truncated a touched store, after this snapshot was taken.
    pub fn commit(&mut self) -> StorageResult<bool> {
        self.ensure_open()?;
        self.finished = true;
        if self.writes.is_empty() {
            self.release_snapshot();
            return Ok(true);
        }

        let env = Arc::clone(&self.env);
        let mut guard = env.state.write();
        let state = &mut *guard;
        let conflict = self.conflicts(state);
        // released under the state lock, so no prune can run in between
        self.release_snapshot();
        if conflict {
            return Ok(false);
        }

        let version = state.version + 1;
        for (name, pending) in std::mem::take(&mut self.writes) {
            let slot = state.stores.entry(name.clone()).or_default();
            let store = Arc::make_mut(slot);
            if pending.truncated {
                store.entries.clear();
                store.key_versions.clear();
                store.truncated_at = version;
            }
            store.modified_at = version;
            for (key, value) in pending.entries {
                match value {
                    Some(value) => {
                        store.entries.insert(key.clone(), value);
                    }
                    None => {
                        store.entries.remove(&key);
                        state.tombstones.push_back(Tombstone {
                            version,
                            store: name.clone(),
                            key: key.clone(),
                        });
                    }
                }
                store.key_versions.insert(key, version);
            }
        }
        state.version = version;
        state.prune_tombstones(env.oldest_snapshot().unwrap_or(version));
        Ok(true)
    }

    /// Whether a commit after this snapshot touched what this transaction
    /// wrote, point-read or scanned
    fn conflicts(&self, state: &Committed) -> bool {
        let since = self.snapshot_version;
        for (name, pending) in &self.writes {
            if let Some(current) = state.stores.get(name) {
                if current.truncated_at > since {
                    debug!(store = %name, "storage conflict: store truncated");
                    return true;
                }
                if pending.truncated {
                    if current.key_versions.values().any(|v| *v > since) {
                        debug!(store = %name, "storage conflict: truncate over concurrent write");
                        return true;
                    }
                    continue;
                }
                if let Some(key) = pending
                    .entries
                    .keys()
                    .find(|k| current.changed_since(k, since))
                {
                    debug!(store = %name, key = ?key, "storage conflict: write-write");
                    return true;
                }
            }
        }
        for (name, key) in &self.reads {
            if let Some(current) = state.stores.get(name) {
                if current.changed_since(key, since) {
                    debug!(store = %name, key = ?key, "storage conflict: stale read");
                    return true;
                }
            }
        }
        for name in &self.scanned {
            if let Some(current) = state.stores.get(name) {
                if current.modified_since(since) {
                    debug!(store = %name, "storage conflict: stale scan");
                    return true;
                }
            }
        }
        false
    }

    /// Discard all buffered writes
    pub fn abort(&mut self) {
        self.finished = true;
        self.writes.clear();
        self.reads.clear();
        self.scanned.clear();
        self.release_snapshot();
    }

    fn release_snapshot(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.env.release_snapshot(self.snapshot_version);
        }
    }
}

impl Drop for StorageTx {
    fn drop(&mut self) {
        self.release_snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE: &str = "test.store";

    fn put(env: &Arc<Environment>, key: &[u8], value: &[u8]) {
        let mut tx = env.begin(false).unwrap();
        tx.put(STORE, key.to_vec(), value.to_vec()).unwrap();
        assert!(tx.commit().unwrap());
    }

    #[test]
    fn test_read_your_own_writes() {
        let env = Environment::new();
        let mut tx = env.begin(false).unwrap();
        tx.put(STORE, b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(tx.get(STORE, b"a").unwrap(), Some(b"1".to_vec()));
        tx.delete(STORE, b"a").unwrap();
        assert_eq!(tx.get(STORE, b"a").unwrap(), None);
    }

    #[test]
    fn test_snapshot_isolation() {
        let env = Environment::new();
        put(&env, b"a", b"1");

        let mut reader = env.begin(true).unwrap();
        put(&env, b"a", b"2");

        assert_eq!(reader.get(STORE, b"a").unwrap(), Some(b"1".to_vec()));
        let mut fresh = env.begin(true).unwrap();
        assert_eq!(fresh.get(STORE, b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_write_write_conflict() {
        let env = Environment::new();
        let mut first = env.begin(false).unwrap();
        let mut second = env.begin(false).unwrap();

        first.put(STORE, b"k".to_vec(), b"1".to_vec()).unwrap();
        second.put(STORE, b"k".to_vec(), b"2".to_vec()).unwrap();

        assert!(first.commit().unwrap());
        assert!(!second.commit().unwrap());

        let mut check = env.begin(true).unwrap();
        assert_eq!(check.get(STORE, b"k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_stale_read_conflict() {
        let env = Environment::new();
        put(&env, b"meta", b"v1");

        let mut tx = env.begin(false).unwrap();
        assert_eq!(tx.get(STORE, b"meta").unwrap(), Some(b"v1".to_vec()));
        put(&env, b"meta", b"v2");

        tx.put(STORE, b"other".to_vec(), b"x".to_vec()).unwrap();
        assert!(!tx.commit().unwrap());
    }

    #[test]
    fn test_truncate_conflicts_with_concurrent_writer() {
        let env = Environment::new();
        put(&env, b"a", b"1");

        let mut writer = env.begin(false).unwrap();
        writer.put(STORE, b"b".to_vec(), b"2".to_vec()).unwrap();

        let mut truncator = env.begin(false).unwrap();
        truncator.truncate(STORE).unwrap();
        assert!(truncator.commit().unwrap());

        assert!(!writer.commit().unwrap());
        assert_eq!(env.begin(true).unwrap().count(STORE).unwrap(), 0);
    }

    #[test]
    fn test_stale_scan_conflict() {
        let env = Environment::new();
        put(&env, b"a", b"1");

        let mut rebuild = env.begin(false).unwrap();
        assert_eq!(rebuild.scan(STORE).unwrap().len(), 1);
        put(&env, b"b", b"2");

        rebuild.put("other.store", b"x".to_vec(), b"y".to_vec()).unwrap();
        assert!(!rebuild.commit().unwrap());

        // Read-only scans are never validated.
        let mut reader = env.begin(true).unwrap();
        assert_eq!(reader.scan(STORE).unwrap().len(), 2);
        put(&env, b"c", b"3");
        assert!(reader.commit().unwrap());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let env = Environment::new();
        let mut tx = env.begin(true).unwrap();
        let err = tx.put(STORE, b"a".to_vec(), b"1".to_vec()).unwrap_err();
        assert_eq!(err.code(), "QDB_STORAGE_READ_ONLY");
    }

    #[test]
    fn test_idempotent_commit_is_noop() {
        let env = Environment::new();
        let mut tx = env.begin(false).unwrap();
        assert!(tx.is_idempotent());
        assert!(tx.commit().unwrap());
        assert_eq!(env.version(), 0);
        assert!(matches!(tx.commit(), Err(StorageError::Finished)));
    }

    #[test]
    fn test_scan_merges_pending_writes() {
        let env = Environment::new();
        put(&env, &tuple_key(1), b"one");
        put(&env, &tuple_key(2), b"two");

        let mut tx = env.begin(false).unwrap();
        tx.delete(STORE, &tuple_key(1)).unwrap();
        tx.put(STORE, tuple_key(3), b"three".to_vec()).unwrap();

        let keys: Vec<u64> = tx
            .scan(STORE)
            .unwrap()
            .iter()
            .filter_map(|(k, _)| decode_tuple_key(k))
            .collect();
        assert_eq!(keys, vec![2, 3]);

        let lower = tuple_key(3);
        let ranged = tx
            .scan_range(STORE, Bound::Included(lower.as_slice()), Bound::Unbounded)
            .unwrap();
        assert_eq!(ranged.len(), 1);
    }

    #[test]
    fn test_json_helpers() {
        let env = Environment::new();
        let mut tx = env.begin(false).unwrap();
        tx.put_json(STORE, b"cfg".to_vec(), &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = tx.get_json(STORE, b"cfg").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_deleted_key_versions_pruned_after_older_snapshots_end() {
        let env = Environment::new();
        let tracked = |env: &Arc<Environment>| {
            env.state.read().stores[STORE]
                .key_versions
                .contains_key(b"a".as_slice())
        };
        put(&env, b"a", b"1");
        let mut old = env.begin(false).unwrap();

        let mut tx = env.begin(false).unwrap();
        tx.delete(STORE, b"a").unwrap();
        assert!(tx.commit().unwrap());
        put(&env, b"b", b"2");
        assert!(tracked(&env));

        // the older snapshot still sees the delete as a conflict
        old.put(STORE, b"a".to_vec(), b"x".to_vec()).unwrap();
        assert!(!old.commit().unwrap());

        put(&env, b"c", b"3");
        assert!(!tracked(&env));
        assert_eq!(env.state.read().tombstones.len(), 0);
        assert!(env.snapshots.lock().is_empty());
    }

    #[test]
    fn test_dropped_transaction_releases_snapshot() {
        let env = Environment::new();
        let tx = env.begin(true).unwrap();
        let other = env.begin(false).unwrap();
        assert_eq!(env.oldest_snapshot(), Some(0));
        drop(tx);
        assert_eq!(env.oldest_snapshot(), Some(0));
        drop(other);
        assert_eq!(env.oldest_snapshot(), None);
    }

    #[test]
    fn test_closed_environment_refuses_begin() {
        let env = Environment::new();
        env.close();
        assert!(matches!(env.begin(true), Err(StorageError::Closed)));
    }
}
