//! The submission pipeline: validate, admit, persist.

use crate::{
    error::{IngestError, Result},
    models::{NewFactRecord, StoredFact},
    rate_limit::{Admission, RateLimiter},
    repository::FactRepository,
    validation::FactValidator,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Successful outcome of [`IngestService::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub client_address: String,
    pub system_fact_count: usize,
    pub package_fact_count: usize,
}

impl Receipt {
    fn pending(record: &NewFactRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            client_address: record.client_address.to_string(),
            system_fact_count: record.system_facts.len(),
            package_fact_count: record.package_facts.len(),
        }
    }

    fn stored(self, stored: StoredFact) -> Self {
        Self {
            id: stored.id,
            created_at: stored.created_at,
            ..self
        }
    }
}

#[derive(Clone)]
pub struct IngestService {
    validator: FactValidator,
    limiter: RateLimiter,
    repository: Arc<dyn FactRepository>,
}

impl IngestService {
    pub fn new(
        validator: FactValidator,
        limiter: RateLimiter,
        repository: Arc<dyn FactRepository>,
    ) -> Self {
        Self {
            validator,
            limiter,
            repository,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run one submission through the pipeline.
    ///
    /// Invalid submissions never touch the rate limiter. A failed write
    /// releases the admission so the client can retry once the short storage
    /// cooldown passes.
    pub async fn submit(
        &self,
        body: &[u8],
        client_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Receipt> {
        let result = self.submit_inner(body, client_address, now).await;
        if let Err(err) = &result {
            log_failure(client_address, err);
        }
        result
    }

    async fn submit_inner(
        &self,
        body: &[u8],
        client_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Receipt> {
        let submission = self.validator.validate(body, client_address)?;
        let address = submission.client_address;
        info!(client_address = %address, "facts submission received");

        let permit = match self.limiter.check_and_record(address, now).await? {
            Admission::Admitted(permit) => permit,
            Admission::Rejected { retry_after } => {
                return Err(IngestError::RateLimited(retry_after));
            }
        };

        let record = NewFactRecord::from_submission(submission, now);
        let pending = Receipt::pending(&record);
        match self.repository.persist(record).await {
            Ok(stored) => {
                permit.commit(stored.created_at);
                let receipt = pending.stored(stored);
                info!(
                    client_address = %address,
                    id = %receipt.id,
                    system = receipt.system_fact_count,
                    package = receipt.package_fact_count,
                    "stored facts"
                );
                Ok(receipt)
            }
            Err(err) => {
                permit.release(now);
                Err(err.into())
            }
        }
    }
}

/// Record a failed submission with its address and failure kind.
pub(crate) fn log_failure(client_address: &str, err: &IngestError) {
    match err {
        IngestError::RateLimited(retry) => warn!(
            client_address,
            kind = err.kind(),
            retry_after_secs = retry.as_secs(),
            "rate limit hit"
        ),
        IngestError::StorageConflict(source) => warn!(
            client_address,
            kind = err.kind(),
            error = %source,
            "failed to store facts"
        ),
        IngestError::Internal(source) => warn!(
            client_address,
            kind = err.kind(),
            error = ?source,
            "unexpected error while storing facts"
        ),
        _ => warn!(client_address, kind = err.kind(), error = %err, "rejected submission"),
    }
}
