use super::{FactRepository, StorageError};
use crate::{
    db::{PgConnectionManager, PgPool},
    models::{FactRecord, HostFactInsert, HostFactRow, NewFactRecord, StoredFact},
    schema::host_facts,
};
use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::RunQueryDsl;
use std::net::IpAddr;
use tracing::{debug, error};
use uuid::Uuid;

/// Fact repository over the `host_facts` table.
#[derive(Clone)]
pub struct PgFactRepository {
    pool: PgPool,
}

impl PgFactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<PooledConnection<'_, PgConnectionManager>, StorageError> {
        self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            StorageError::Unavailable(format!("{err:?}"))
        })
    }
}

#[async_trait]
impl FactRepository for PgFactRepository {
    async fn persist(&self, record: NewFactRecord) -> Result<StoredFact, StorageError> {
        let mut conn = self.connection().await?;
        let row = HostFactInsert::from(record);
        debug!(id = %row.id, client_address = %row.client_address, "inserting host facts");

        let (id, created_at) = diesel::insert_into(host_facts::table)
            .values(&row)
            .returning((host_facts::id, host_facts::created_at))
            .get_result::<(Uuid, DateTime<Utc>)>(&mut *conn)
            .await
            .map_err(classify)?;

        Ok(StoredFact { id, created_at })
    }

    async fn last_submission_time(
        &self,
        address: IpAddr,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let mut conn = self.connection().await?;
        host_facts::table
            .filter(host_facts::client_address.eq(address.to_string()))
            .select(max(host_facts::created_at))
            .get_result::<Option<DateTime<Utc>>>(&mut *conn)
            .await
            .map_err(classify)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<FactRecord>, StorageError> {
        let mut conn = self.connection().await?;
        let row = host_facts::table
            .find(id)
            .select(HostFactRow::as_select())
            .first::<HostFactRow>(&mut *conn)
            .await
            .optional()
            .map_err(classify)?;
        Ok(row.map(FactRecord::from))
    }
}

/// Sort Diesel failures into the storage taxonomy.
fn classify(err: DieselError) -> StorageError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            StorageError::Unavailable(info.message().to_string())
        }
        DieselError::DatabaseError(kind, info) => {
            StorageError::Conflict(format!("{kind:?}: {}", info.message()))
        }
        DieselError::BrokenTransactionManager => {
            StorageError::Unavailable("broken transaction manager".to_string())
        }
        other => StorageError::Other(other.into()),
    }
}
