//! Download Record Store
//!
//! Persists download intents and their lifecycle status. The store is the
//! single source of truth across restarts; the in-memory session registry
//! is only a cache of liveness on top of it.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use crate::types::{DownloadId, DownloadRecord};
use async_trait::async_trait;

/// Storage trait for persisting download records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails if a record with the same
    /// `source_reference` already exists (idempotent-start invariant).
    async fn insert(&self, record: &DownloadRecord) -> Result<()>;

    /// Update an existing record by id
    async fn update(&self, record: &DownloadRecord) -> Result<()>;

    /// Load a record by id
    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>>;

    /// Look up a record by its original source reference
    async fn find_by_source(&self, reference: &str) -> Result<Option<DownloadRecord>>;

    /// List records, optionally restricted to one owner
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<DownloadRecord>>;

    /// Load every record (startup recovery)
    async fn load_all(&self) -> Result<Vec<DownloadRecord>>;

    /// Delete a record
    async fn delete(&self, id: DownloadId) -> Result<()>;

    /// Check that the backing store is reachable
    async fn health_check(&self) -> Result<()>;
}

/// In-memory record store for tests and storage-less operation
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: parking_lot::RwLock<std::collections::HashMap<DownloadId, DownloadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        let mut records = self.records.write();
        if records
            .values()
            .any(|r| r.source_reference == record.source_reference)
        {
            return Err(Error::Database(format!(
                "record already exists for source {}",
                record.source_reference
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &DownloadRecord) -> Result<()> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn find_by_source(&self, reference: &str) -> Result<Option<DownloadRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.source_reference == reference)
            .cloned())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<DownloadRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| owner_id.is_none_or(|owner| r.owner_id == owner))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn load_all(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        self.records.write().remove(&id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
