//! Storage seam for fact submissions.
//!
//! The ingestion path only needs three things from storage: append a record,
//! find the newest accepted submission for an address, and read a record back
//! by identifier. PostgreSQL is the production backend; the in-memory backend
//! serves local runs (`memory://`) and tests.

mod memory;
mod postgres;

pub use memory::MemoryFactRepository;
pub use postgres::PgFactRepository;

use crate::{
    config::AppConfig,
    db,
    models::{FactRecord, NewFactRecord, StoredFact},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{net::IpAddr, sync::Arc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or a connection was lost.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The write was refused by a constraint or a serialization failure.
    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait FactRepository: Send + Sync {
    /// Durably append `record`.
    async fn persist(&self, record: NewFactRecord) -> Result<StoredFact, StorageError>;

    /// Creation time of the newest record for `address`, if any.
    async fn last_submission_time(
        &self,
        address: IpAddr,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn fetch(&self, id: Uuid) -> Result<Option<FactRecord>, StorageError>;
}

/// Build the repository selected by `FACTS_DATABASE_URL`.
pub async fn connect(config: &AppConfig) -> anyhow::Result<Arc<dyn FactRepository>> {
    if config.uses_memory_store() {
        info!("using in-memory fact store; submissions will not survive a restart");
        return Ok(Arc::new(MemoryFactRepository::new()));
    }

    let pool = db::connect_pool(config).await?;
    if config.auto_migrate {
        db::apply_schema(&pool).await?;
    }
    Ok(Arc::new(PgFactRepository::new(pool)))
}
