//! In-memory write buffer.
//!
//! A `MemTable` is an ordered concurrent map from user key to the newest
//! record seen for that key, sized by approximate byte accounting. The
//! `MemTableManager` pairs the mutable table with a queue of rotated tables
//! that are still being flushed; readers merge across all of them.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};

use crate::record::Record;

#[derive(Debug)]
pub struct MemTable {
    map: SkipMap<Bytes, Record>,
    approximate_bytes: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            approximate_bytes: AtomicU64::new(0),
        }
    }

    /// Inserts or overwrites the record for its key.
    ///
    /// An existing record that wins the last-write-wins comparison is kept:
    /// internal replica hops can deliver older timestamps after newer ones.
    pub fn upsert(&self, record: Record) {
        if let Some(existing) = self.map.get(record.key()) {
            if existing.value().wins_over(&record) {
                return;
            }
        }
        self.approximate_bytes
            .fetch_add(record.approximate_bytes(), AtomicOrdering::Relaxed);
        self.map.insert(record.key().clone(), record);
    }

    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Sorted snapshot of records with keys in `[from, to)`.
    pub fn collect_range(&self, from: Option<&Bytes>, to: Option<&Bytes>) -> Vec<Record> {
        let bounds = range_bounds(from, to);
        self.map
            .range(bounds)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Full sorted snapshot, tombstones included.
    pub fn collect_all(&self) -> Vec<Record> {
        self.map.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn range_bounds(from: Option<&Bytes>, to: Option<&Bytes>) -> (Bound<Bytes>, Bound<Bytes>) {
    let start = match from {
        Some(key) => Bound::Included(key.clone()),
        None => Bound::Unbounded,
    };
    let end = match to {
        Some(key) => Bound::Excluded(key.clone()),
        None => Bound::Unbounded,
    };
    (start, end)
}

#[derive(Debug)]
pub struct MemTableManager {
    mutable: RwLock<Arc<MemTable>>,
    immutables: Mutex<VecDeque<Arc<MemTable>>>,
}

impl MemTableManager {
    pub fn new() -> Self {
        Self {
            mutable: RwLock::new(Arc::new(MemTable::new())),
            immutables: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mutable(&self) -> Arc<MemTable> {
        self.mutable.read().clone()
    }

    /// Swaps in a fresh mutable table and parks the old one for flushing.
    pub fn rotate(&self) -> Arc<MemTable> {
        let mut guard = self.mutable.write();
        let old = std::mem::replace(&mut *guard, Arc::new(MemTable::new()));
        self.immutables.lock().push_front(old.clone());
        old
    }

    /// Whether a rotated table is still waiting to be persisted.
    pub fn contains(&self, table: &Arc<MemTable>) -> bool {
        self.immutables
            .lock()
            .iter()
            .any(|parked| Arc::ptr_eq(parked, table))
    }

    /// Removes a flushed table from the queue once its segment is published.
    pub fn drop_immutable(&self, table: &Arc<MemTable>) {
        self.immutables
            .lock()
            .retain(|parked| !Arc::ptr_eq(parked, table));
    }

    /// All live tables, newest first: the mutable table, then rotated tables
    /// in rotation order.
    pub fn snapshot(&self) -> Vec<Arc<MemTable>> {
        let mut out = vec![self.mutable()];
        out.extend(self.immutables.lock().iter().cloned());
        out
    }

    pub fn mutable_approximate_bytes(&self) -> u64 {
        self.mutable.read().approximate_bytes()
    }
}

impl Default for MemTableManager {
    fn default() -> Self {
        Self::new()
    }
}
