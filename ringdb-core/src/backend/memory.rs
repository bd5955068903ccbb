//! In-memory transactional backend
//!
//! Optimistic concurrency over a single ordered map: every committed write
//! bumps a global version, each key remembers the version that last touched
//! it, and commit re-validates the transaction's read footprint against
//! those versions. Cleared keys keep a versioned placeholder so range reads
//! conflict correctly with concurrent deletes. Enforces the same limits as
//! the production contract (transaction window, write bytes, value size).

use super::{Backend, BackendError, KeyValue, Transaction, MAX_TXN_BYTES, MAX_TXN_DURATION, MAX_VALUE_BYTES};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` marks a cleared key retained for conflict detection
    value: Option<Vec<u8>>,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    version: u64,
    map: BTreeMap<Vec<u8>, Entry>,
}

/// Shared in-process backend; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, cleared placeholders excluded
    pub fn live_keys(&self) -> usize {
        self.state
            .read()
            .map
            .values()
            .filter(|e| e.value.is_some())
            .count()
    }
}

impl Backend for MemoryBackend {
    fn transaction(&self) -> Result<Box<dyn Transaction + '_>> {
        let read_version = self.state.read().version;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            read_version,
            started: Instant::now(),
            reads: Vec::new(),
            writes: BTreeMap::new(),
            cleared_ranges: Vec::new(),
            write_bytes: 0,
        }))
    }
}

#[derive(Debug)]
enum ReadFootprint {
    Key(Vec<u8>),
    Range(Vec<u8>, Vec<u8>),
}

struct MemoryTransaction {
    state: Arc<RwLock<State>>,
    read_version: u64,
    started: Instant,
    reads: Vec<ReadFootprint>,
    /// `None` buffers a clear, `Some` a set
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    write_bytes: usize,
}

impl MemoryTransaction {
    fn check_window(&self) -> Result<()> {
        if self.started.elapsed() > MAX_TXN_DURATION {
            return Err(BackendError::TransactionTooOld.into());
        }
        Ok(())
    }

    fn locally_cleared(&self, key: &[u8]) -> bool {
        self.cleared_ranges
            .iter()
            .any(|(start, end)| key >= start.as_slice() && key < end.as_slice())
    }

    fn budget(&mut self, bytes: usize) -> Result<()> {
        self.write_bytes += bytes;
        if self.write_bytes > MAX_TXN_BYTES {
            return Err(BackendError::TransactionTooLarge(self.write_bytes).into());
        }
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_window()?;
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        if self.locally_cleared(key) {
            return Ok(None);
        }
        self.reads.push(ReadFootprint::Key(key.to_vec()));
        let state = self.state.read();
        match state.map.get(key) {
            Some(entry) if entry.version > self.read_version => {
                // a commit landed after this snapshot was taken
                Err(BackendError::CommitConflict.into())
            }
            Some(entry) => Ok(entry.value.clone()),
            None => Ok(None),
        }
    }

    fn get_range(&mut self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>> {
        self.check_window()?;
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }
        self.reads
            .push(ReadFootprint::Range(start.to_vec(), end.to_vec()));

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        {
            let state = self.state.read();
            let bounds = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
            for (key, entry) in state.map.range(bounds) {
                if entry.version > self.read_version {
                    return Err(BackendError::CommitConflict.into());
                }
                if entry.value.is_some() && !self.locally_cleared(key) {
                    merged.insert(key.clone(), entry.value.clone());
                }
            }
        }
        // buffered writes win over committed state
        for (key, value) in self.writes.range(start.to_vec()..end.to_vec()) {
            merged.insert(key.clone(), value.clone());
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .take(limit)
            .collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_window()?;
        if value.len() > MAX_VALUE_BYTES {
            return Err(BackendError::ValueTooLarge(value.len()).into());
        }
        self.budget(key.len() + value.len())?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn clear_range(&mut self, start: &[u8], end: &[u8]) {
        if start >= end {
            return;
        }
        let buffered: Vec<Vec<u8>> = self
            .writes
            .range(start.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for key in buffered {
            self.writes.remove(&key);
        }
        self.cleared_ranges.push((start.to_vec(), end.to_vec()));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.check_window()?;
        let mut state = self.state.write();

        // validate the read footprint against commits since our snapshot
        for read in &self.reads {
            match read {
                ReadFootprint::Key(key) => {
                    if let Some(entry) = state.map.get(key) {
                        if entry.version > self.read_version {
                            return Err(BackendError::CommitConflict.into());
                        }
                    }
                }
                ReadFootprint::Range(start, end) => {
                    let bounds =
                        (Bound::Included(start.clone()), Bound::Excluded(end.clone()));
                    for (_, entry) in state.map.range(bounds) {
                        if entry.version > self.read_version {
                            return Err(BackendError::CommitConflict.into());
                        }
                    }
                }
            }
        }

        if self.writes.is_empty() && self.cleared_ranges.is_empty() {
            return Ok(());
        }

        state.version += 1;
        let version = state.version;
        for (start, end) in &self.cleared_ranges {
            let bounds = (Bound::Included(start.clone()), Bound::Excluded(end.clone()));
            let doomed: Vec<Vec<u8>> = state
                .map
                .range(bounds)
                .filter(|(_, e)| e.value.is_some())
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                state.map.insert(key, Entry { value: None, version });
            }
        }
        for (key, value) in self.writes {
            state.map.insert(key, Entry { value, version });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(backend: &MemoryBackend, key: &[u8], value: &[u8]) {
        let mut txn = backend.transaction().unwrap();
        txn.set(key, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_set_get_roundtrip() {
        let backend = MemoryBackend::new();
        set(&backend, b"a", b"1");
        let mut txn = backend.transaction().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_uncommitted_writes_invisible() {
        let backend = MemoryBackend::new();
        {
            let mut txn = backend.transaction().unwrap();
            txn.set(b"a", b"1").unwrap();
            // dropped without commit
        }
        let mut txn = backend.transaction().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_read_own_writes() {
        let backend = MemoryBackend::new();
        let mut txn = backend.transaction().unwrap();
        txn.set(b"a", b"1").unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        txn.clear(b"a");
        assert_eq!(txn.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_range_order_and_limit() {
        let backend = MemoryBackend::new();
        for k in [b"b".as_slice(), b"a", b"c", b"d"] {
            set(&backend, k, b"v");
        }
        let mut txn = backend.transaction().unwrap();
        let rows = txn.get_range(b"a", b"d", 2).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b"]);
    }

    #[test]
    fn test_write_write_conflict_detected() {
        let backend = MemoryBackend::new();
        set(&backend, b"a", b"0");

        let mut t1 = backend.transaction().unwrap();
        let mut t2 = backend.transaction().unwrap();
        t1.get(b"a").unwrap();
        t2.get(b"a").unwrap();
        t1.set(b"a", b"1").unwrap();
        t2.set(b"a", b"2").unwrap();
        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_range_conflicts_with_concurrent_insert() {
        let backend = MemoryBackend::new();
        let mut t1 = backend.transaction().unwrap();
        assert!(t1.get_range(b"a", b"z", 100).unwrap().is_empty());

        set(&backend, b"m", b"new");
        t1.set(b"out", b"x").unwrap();
        assert!(t1.commit().is_err());
    }

    #[test]
    fn test_clear_range_is_atomic_and_conflicts() {
        let backend = MemoryBackend::new();
        set(&backend, b"a1", b"v");
        set(&backend, b"a2", b"v");

        let mut t1 = backend.transaction().unwrap();
        t1.clear_range(b"a", b"b");
        assert!(t1.get_range(b"a", b"b", 10).unwrap().is_empty());
        t1.commit().unwrap();

        let mut txn = backend.transaction().unwrap();
        assert!(txn.get_range(b"a", b"b", 10).unwrap().is_empty());
        assert_eq!(backend.live_keys(), 0);
    }

    #[test]
    fn test_value_size_limit() {
        let backend = MemoryBackend::new();
        let mut txn = backend.transaction().unwrap();
        let big = vec![0u8; MAX_VALUE_BYTES + 1];
        assert!(txn.set(b"k", &big).is_err());
    }

    #[test]
    fn test_clear_range_then_set_within_txn() {
        let backend = MemoryBackend::new();
        set(&backend, b"a1", b"old");
        let mut txn = backend.transaction().unwrap();
        txn.clear_range(b"a", b"b");
        txn.set(b"a1", b"new").unwrap();
        assert_eq!(txn.get(b"a1").unwrap(), Some(b"new".to_vec()));
        txn.commit().unwrap();
        let mut txn = backend.transaction().unwrap();
        assert_eq!(txn.get(b"a1").unwrap(), Some(b"new".to_vec()));
    }
}
