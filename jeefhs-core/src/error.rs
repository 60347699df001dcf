//! Error types for jeefhs-core
//!
//! Errors fall into three families:
//! - **Storage faults** come from the local event buffer and are surfaced to
//!   whoever called into [`LocalStore`](crate::store::LocalStore).
//! - **Connectivity faults** mean the cloud could not be reached or the write
//!   outcome is unknown.
//! - **Replication faults** mean the cloud answered but rejected the batch.
//!
//! The sync daemon retries both connectivity and replication faults the same
//! way; producers only ever see storage faults.

use thiserror::Error;

/// Main error type for the jeefhs-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Local database error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row failed its checksum
    #[error("corrupt event record at seq {seq}")]
    Corrupt { seq: i64 },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cloud endpoint unreachable, timed out, or answered with a server error
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Cloud endpoint rejected the batch
    #[error("replication error: {0}")]
    Replication(String),

    /// Unknown security mode
    #[error("unsupported mode '{0}'")]
    InvalidMode(String),

    /// Sensor or actuator failure
    #[error("device error: {0}")]
    Device(String),

    /// Malformed control command
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl Error {
    /// True for faults in the local event buffer.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) | Error::Corrupt { .. }
        )
    }

    /// True for failures the sync daemon retries after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity(_) | Error::Replication(_)) || self.is_storage_fault()
    }
}

/// Result type alias for jeefhs-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert!(Error::Corrupt { seq: 3 }.is_storage_fault());
        assert!(!Error::Connectivity("down".into()).is_storage_fault());
        assert!(Error::Connectivity("down".into()).is_retryable());
        assert!(Error::Replication("schema mismatch".into()).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }
}
