use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote store rejected a stale write: {0}")]
    StaleWriteRejected(String),

    #[error("Field {field} does not hold a {expected} value")]
    SchemaMismatch { field: String, expected: &'static str },

    #[error("No authenticated session")]
    SubsystemNotInitialized,

    #[error("Another write is already in flight")]
    WriteInFlight,

    #[error("Write cancelled before it was acknowledged")]
    Cancelled,

    #[error("Timeout exceeded: {operation} took longer than {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cannot move signup stage from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid field catalog: {0}")]
    Catalog(String),

    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a user-facing "try again" makes sense for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_)
                | SyncError::StaleWriteRejected(_)
                | SyncError::WriteInFlight
                | SyncError::Cancelled
                | SyncError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_retryable_but_bad_input_is_not() {
        assert!(SyncError::RemoteUnavailable("offline".into()).is_retryable());
        assert!(SyncError::Timeout {
            operation: "merge_update".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!SyncError::SubsystemNotInitialized.is_retryable());
        assert!(!SyncError::InvalidDocument("not an object".into()).is_retryable());
    }
}
