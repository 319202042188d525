//! Error taxonomy shared by the core and the application layer.
//!
//! Only [`Error::Configuration`] and [`Error::Storage`] are allowed to
//! terminate a request path. Insufficient evidence is never an error; it is
//! an `ABSTAIN` [`Decision`](crate::guardrail::Decision). Schema failures and
//! upstream timeouts are produced by components but resolved into decisions
//! by the query engine before they reach a caller.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid chunking, scoring, fusion, or guardrail parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A source key or edition that cannot form a valid identifier.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Re-ingestion of changed text under an unchanged `doc_id`.
    #[error("version conflict for {doc_id}: stored hash {stored_hash}, incoming hash {incoming_hash}")]
    VersionConflict {
        doc_id: String,
        stored_hash: String,
        incoming_hash: String,
    },

    /// Generation output that does not match the response schema.
    #[error("schema validation failed: {}", .violations.join("; "))]
    SchemaValidation { violations: Vec<String> },

    /// An embedding or generation call exceeded its time budget.
    #[error("{capability} timed out after {timeout_ms} ms")]
    UpstreamTimeout {
        capability: &'static str,
        timeout_ms: u64,
    },

    /// The backing store is inconsistent or unavailable.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
