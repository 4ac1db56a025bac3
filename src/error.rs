//! Error types for Truck-Ratings

use thiserror::Error;

/// Result type alias for Truck-Ratings operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Truck-Ratings
#[derive(Error, Debug)]
pub enum Error {
    /// Store read or write temporarily failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another writer committed to the same aggregate since it was read
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Conflict retries were exhausted for one aggregate
    #[error("Transaction on {entity_id} gave up after {attempts} attempts")]
    RetriesExhausted { entity_id: String, attempts: u32 },

    /// The triggering rating record has no usable value
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The stored aggregate has a shape no fold could have produced
    #[error("Malformed aggregate for {entity_id}: {reason}")]
    MalformedAggregate { entity_id: String, reason: String },

    /// Document path or identifier does not match the expected layout
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether redelivering the same event may succeed.
    ///
    /// Conflicts and exhausted retries count as transient: the store is
    /// healthy, the aggregate was just busy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Conflict(_) | Error::RetriesExhausted { .. } | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
