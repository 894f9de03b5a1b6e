//! Fact records and their Diesel row mappings.

use crate::{schema::host_facts, validation::ValidatedSubmission};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::IpAddr;
use uuid::Uuid;

/// A submission ready to be written. Identifier and timestamps are fixed
/// before the write so the caller knows them even if storage echoes nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFactRecord {
    pub id: Uuid,
    pub client_address: IpAddr,
    pub system_facts: Map<String, Value>,
    pub package_facts: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl NewFactRecord {
    pub fn new(
        client_address: IpAddr,
        system_facts: Map<String, Value>,
        package_facts: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_address,
            system_facts,
            package_facts,
            created_at,
        }
    }

    pub fn from_submission(submission: ValidatedSubmission, created_at: DateTime<Utc>) -> Self {
        Self::new(
            submission.client_address,
            submission.system_facts,
            submission.package_facts,
            created_at,
        )
    }
}

/// What the write path hands back on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoredFact {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A persisted submission as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRecord {
    pub id: Uuid,
    pub client_address: String,
    pub system_facts: Value,
    pub package_facts: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NewFactRecord> for FactRecord {
    fn from(record: NewFactRecord) -> Self {
        Self {
            id: record.id,
            client_address: record.client_address.to_string(),
            system_facts: Value::Object(record.system_facts),
            package_facts: Value::Object(record.package_facts),
            created_at: record.created_at,
            updated_at: record.created_at,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = host_facts)]
pub struct HostFactInsert {
    pub id: Uuid,
    pub client_address: String,
    pub system_facts: Value,
    pub package_facts: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NewFactRecord> for HostFactInsert {
    fn from(record: NewFactRecord) -> Self {
        Self {
            id: record.id,
            client_address: record.client_address.to_string(),
            system_facts: Value::Object(record.system_facts),
            package_facts: Value::Object(record.package_facts),
            created_at: record.created_at,
            updated_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = host_facts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HostFactRow {
    pub id: Uuid,
    pub client_address: String,
    pub system_facts: Value,
    pub package_facts: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<HostFactRow> for FactRecord {
    fn from(row: HostFactRow) -> Self {
        Self {
            id: row.id,
            client_address: row.client_address,
            system_facts: row.system_facts,
            package_facts: row.package_facts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
