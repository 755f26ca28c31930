//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::record::{MonotonicSeq, SourceKind, SourceRecord};
use crate::storage::traits::{CursorKey, CursorStore, DocumentSource, StorageError, WritableSource};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// In-memory cursor store.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    values: RwLock<HashMap<String, u64>>,
}

impl InMemoryCursorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a key without going through the async trait.
    pub fn value(&self, key: &CursorKey) -> Result<Option<MonotonicSeq>, StorageError> {
        let values = self.values.read().map_err(|_| lock_err("cursor values"))?;
        Ok(values.get(key.as_str()).copied().map(MonotonicSeq::new))
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<MonotonicSeq>, StorageError> {
        self.value(key)
    }

    async fn set(&self, key: &CursorKey, value: MonotonicSeq) -> Result<(), StorageError> {
        let mut values = self.values.write().map_err(|_| lock_err("cursor values"))?;
        values.insert(key.as_str().to_string(), value.get());
        Ok(())
    }

    async fn increment(&self, key: &CursorKey) -> Result<MonotonicSeq, StorageError> {
        let mut values = self.values.write().map_err(|_| lock_err("cursor values"))?;
        let slot = values.entry(key.as_str().to_string()).or_insert(0);
        *slot = slot
            .checked_add(1)
            .ok_or_else(|| StorageError::Backend(format!("counter overflow: {key}")))?;
        Ok(MonotonicSeq::new(*slot))
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    by_seq: BTreeMap<MonotonicSeq, SourceRecord>,
    ids: HashSet<Uuid>,
}

/// In-memory document collection, indexed by sequence number.
#[derive(Debug)]
pub struct InMemoryCollection {
    kind: SourceKind,
    state: RwLock<CollectionState>,
}

impl InMemoryCollection {
    /// Create an empty collection for `kind`.
    #[must_use]
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            state: RwLock::new(CollectionState::default()),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("collection"))?;
        Ok(state.by_seq.len())
    }

    /// Returns true if the collection holds no records.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl DocumentSource for InMemoryCollection {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_after(&self, after: MonotonicSeq, limit: usize) -> Result<Vec<SourceRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("collection"))?;
        Ok(state
            .by_seq
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn fetch_by_user(&self, user_id: &str) -> Result<Vec<SourceRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("collection"))?;
        Ok(state
            .by_seq
            .values()
            .filter(|record| record.user_id() == Some(user_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WritableSource for InMemoryCollection {
    async fn insert(&self, record: SourceRecord) -> Result<(), StorageError> {
        if record.monotonic_seq == MonotonicSeq::ZERO {
            return Err(StorageError::Backend(format!(
                "{} record {} has no sequence number",
                self.kind, record.id
            )));
        }

        let mut state = self.state.write().map_err(|_| lock_err("collection"))?;
        if state.by_seq.contains_key(&record.monotonic_seq) {
            return Err(StorageError::DuplicateKey(format!(
                "{}:seq:{}",
                self.kind, record.monotonic_seq
            )));
        }
        if !state.ids.insert(record.id) {
            return Err(StorageError::DuplicateKey(format!("{}:id:{}", self.kind, record.id)));
        }
        state.by_seq.insert(record.monotonic_seq, record);
        Ok(())
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Clone)]
pub struct InMemoryStores {
    /// Cursor and counter store.
    pub cursors: Arc<InMemoryCursorStore>,
    /// Bookmark collection.
    pub bookmarks: Arc<InMemoryCollection>,
    /// Review collection.
    pub reviews: Arc<InMemoryCollection>,
    /// Rating collection.
    pub ratings: Arc<InMemoryCollection>,
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self {
            cursors: Arc::new(InMemoryCursorStore::new()),
            bookmarks: Arc::new(InMemoryCollection::new(SourceKind::Bookmark)),
            reviews: Arc::new(InMemoryCollection::new(SourceKind::Review)),
            ratings: Arc::new(InMemoryCollection::new(SourceKind::Rating)),
        }
    }
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection backing `kind`.
    #[must_use]
    pub fn collection(&self, kind: SourceKind) -> Arc<InMemoryCollection> {
        match kind {
            SourceKind::Bookmark => Arc::clone(&self.bookmarks),
            SourceKind::Review => Arc::clone(&self.reviews),
            SourceKind::Rating => Arc::clone(&self.ratings),
        }
    }
}
