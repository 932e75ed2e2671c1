//! Persistence of work records.
//!
//! The relational store of a deployment sits behind [`RecordStore`]. Uniqueness of the record id
//! is enforced by `insert` itself; callers may check [`RecordStore::exists`] first as a fast path
//! but must not rely on it being atomic with the insert.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use snafu::Snafu;

use crate::record::{RecordId, WorkRecord};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("Work record {} already exists", id))]
    Duplicate { id: RecordId },

    #[snafu(display("Work record {} not found", id))]
    NotFound { id: RecordId },

    #[snafu(display("Record store unavailable: {}", message))]
    Unavailable { message: String },
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists(&self, id: &RecordId) -> Result<bool, StoreError>;

    async fn get(&self, id: &RecordId) -> Result<Option<WorkRecord>, StoreError>;

    /// Appends a record. Fails with [`StoreError::Duplicate`] when the id is already stored.
    async fn insert(&self, record: &WorkRecord) -> Result<(), StoreError>;

    /// Replaces a stored record. Fails with [`StoreError::NotFound`] when the id is unknown.
    async fn update(&self, record: &WorkRecord) -> Result<(), StoreError>;

    /// Records started at or after `since`, newest first, at most `limit` of them.
    async fn query_recent(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkRecord>, StoreError>;
}

/// In-process [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordId, WorkRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn exists(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.records.read().contains_key(id))
    }

    async fn get(&self, id: &RecordId) -> Result<Option<WorkRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn insert(&self, record: &WorkRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(record.id()) {
            return DuplicateSnafu {
                id: record.id().clone(),
            }
            .fail();
        }
        records.insert(record.id().clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &WorkRecord) -> Result<(), StoreError> {
        match self.records.write().get_mut(record.id()) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => NotFoundSnafu {
                id: record.id().clone(),
            }
            .fail(),
        }
    }

    async fn query_recent(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let mut recent: Vec<WorkRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.start_time() >= since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| {
            b.start_time()
                .cmp(&a.start_time())
                .then_with(|| a.id().cmp(b.id()))
        });
        recent.truncate(limit);
        Ok(recent)
    }
}
