//! Structural validation of fact submissions.
//!
//! A submission body must be a JSON object carrying exactly two object-typed
//! fields, `system_facts` and `package_facts`. The client address comes from
//! the transport and is checked before the body is looked at, since it is the
//! key the rate limiter works on.

use crate::config::SubmissionLimits;
use serde_json::{Map, Value};
use std::net::IpAddr;
use thiserror::Error;

pub const SYSTEM_FACTS: &str = "system_facts";
pub const PACKAGE_FACTS: &str = "package_facts";

/// Longest textual form of an IPv6 address (with an embedded IPv4 tail).
pub const MAX_ADDRESS_LEN: usize = 45;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("'{0}' is not a valid IPv4 or IPv6 address")]
    InvalidAddress(String),

    #[error("request body of {size} bytes exceeds maximum size of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("'{0}' must be a JSON object")]
    NotAnObject(String),

    #[error("JSON field '{field}' exceeds maximum size of {limit} bytes")]
    FieldTooLarge { field: &'static str, limit: usize },
}

/// A submission that passed every structural check.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSubmission {
    pub client_address: IpAddr,
    pub system_facts: Map<String, Value>,
    pub package_facts: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct FactValidator {
    limits: SubmissionLimits,
}

impl FactValidator {
    pub fn new(limits: SubmissionLimits) -> Self {
        Self { limits }
    }

    pub fn validate(
        &self,
        body: &[u8],
        client_address: &str,
    ) -> Result<ValidatedSubmission, ValidationError> {
        let client_address = parse_client_address(client_address)?;

        if body.len() > self.limits.max_body_bytes {
            return Err(ValidationError::BodyTooLarge {
                size: body.len(),
                limit: self.limits.max_body_bytes,
            });
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|err| ValidationError::MalformedJson(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject("request body".to_string()));
        };

        if let Some(unknown) = fields
            .keys()
            .find(|key| key.as_str() != SYSTEM_FACTS && key.as_str() != PACKAGE_FACTS)
        {
            return Err(ValidationError::UnknownField(unknown.clone()));
        }

        let system_facts = take_object(&mut fields, SYSTEM_FACTS)?;
        let package_facts = take_object(&mut fields, PACKAGE_FACTS)?;

        self.check_field_size(SYSTEM_FACTS, &system_facts)?;
        self.check_field_size(PACKAGE_FACTS, &package_facts)?;

        Ok(ValidatedSubmission {
            client_address,
            system_facts,
            package_facts,
        })
    }

    fn check_field_size(
        &self,
        field: &'static str,
        facts: &Map<String, Value>,
    ) -> Result<(), ValidationError> {
        let limit = self.limits.max_field_bytes;
        if serialized_len(facts) > limit {
            return Err(ValidationError::FieldTooLarge { field, limit });
        }
        Ok(())
    }
}

/// Parse a transport-supplied address into an `IpAddr`.
pub fn parse_client_address(raw: &str) -> Result<IpAddr, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_ADDRESS_LEN {
        return Err(ValidationError::InvalidAddress(raw.to_string()));
    }
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidAddress(raw.to_string()))
}

fn take_object(
    fields: &mut Map<String, Value>,
    name: &'static str,
) -> Result<Map<String, Value>, ValidationError> {
    match fields.remove(name) {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ValidationError::NotAnObject(name.to_string())),
        None => Err(ValidationError::MissingField(name)),
    }
}

/// Compact serialized size in bytes.
fn serialized_len(facts: &Map<String, Value>) -> usize {
    struct Counter(usize);

    impl std::io::Write for Counter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0 += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut counter = Counter(0);
    // Writing into a counter cannot fail and a Map always serializes.
    let _ = serde_json::to_writer(&mut counter, facts);
    counter.0
}
