use super::{FactRepository, StorageError};
use crate::models::{FactRecord, NewFactRecord, StoredFact};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

#[derive(Default)]
struct State {
    records: HashMap<Uuid, FactRecord>,
    latest: HashMap<IpAddr, DateTime<Utc>>,
}

/// Process-local fact store.
pub struct MemoryFactRepository {
    state: RwLock<State>,
    available: AtomicBool,
}

impl Default for MemoryFactRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFactRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl FactRepository for MemoryFactRepository {
    async fn persist(&self, record: NewFactRecord) -> Result<StoredFact, StorageError> {
        self.ensure_available()?;

        let address = record.client_address;
        let stored = StoredFact {
            id: record.id,
            created_at: record.created_at,
        };

        let mut state = self.state.write();
        if state.records.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "duplicate record id {}",
                record.id
            )));
        }
        state.records.insert(record.id, FactRecord::from(record));
        let latest = state.latest.entry(address).or_insert(stored.created_at);
        if *latest < stored.created_at {
            *latest = stored.created_at;
        }

        Ok(stored)
    }

    async fn last_submission_time(
        &self,
        address: IpAddr,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.ensure_available()?;
        Ok(self.state.read().latest.get(&address).copied())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<FactRecord>, StorageError> {
        self.ensure_available()?;
        Ok(self.state.read().records.get(&id).cloned())
    }
}
