use thiserror::Error;

use crate::models::RequestStatus;

/// Errors surfaced by the reconciliation engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// No reference could be pulled out of recognized text. Callers fall
    /// back to manual entry.
    #[error("No extractable reference in recognized text")]
    ExtractionMiss,

    #[error("Storage object already exists at {path}")]
    UploadConflict { path: String },

    #[error("Upload failed: {0}")]
    UploadFailure(String),

    #[error("Realtime transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Request {request_id} is {current}; cannot {attempted}")]
    InvalidTransition {
        request_id: i64,
        current: RequestStatus,
        attempted: &'static str,
    },

    /// Raised by stores when the request already has a ledger entry
    #[error("Request {request_id} already posted as ledger entry {entry_id}")]
    DuplicatePosting { request_id: i64, entry_id: i64 },

    /// Raised by stores when the prior ledger entry moved underneath an append
    #[error("Ledger for member {member_id} changed during posting")]
    StaleBalance { member_id: i64 },

    #[error("Mutation on {key} failed: {source}")]
    MutationFailure {
        key: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("User {actor_id} is not allowed to {action}")]
    Forbidden { actor_id: i64, action: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The database schema cannot guarantee the ledger's invariants
    #[error("Schema check failed: {0}")]
    Schema(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UploadFailure(_)
                | EngineError::TransportUnavailable(_)
                | EngineError::StaleBalance { .. }
                | EngineError::Database(_)
        )
    }
}

/// Extract clean error message from database error strings
///
/// Removes technical error codes and prefixes like:
/// "error returned from database: 1062 (23000): Duplicate entry '7' for key 'uq_member_tx_request'"
///
/// Returns only the meaningful error message:
/// "Duplicate entry '7' for key 'uq_member_tx_request'"
pub fn extract_clean_error(error_msg: &str) -> String {
    if error_msg.contains("error returned from database:") {
        // Find the last "): " after the code, everything after it is the actual error message
        if let Some(code_end) = error_msg.rfind("): ") {
            error_msg[code_end + 3..].trim().to_string()
        } else if let Some(last_colon) = error_msg.rfind(": ") {
            error_msg[last_colon + 2..].trim().to_string()
        } else {
            error_msg.to_string()
        }
    } else {
        error_msg.to_string()
    }
}
