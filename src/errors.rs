//! Error types for event store operations

use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

/// Errors that can occur when writing, reading or subscribing to events
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The write condition evaluated to false against the current stream version
    #[error("WriteCondition was not fulfilled. Expected version {expected} but was {actual}.")]
    WriteConditionNotFulfilled {
        /// Human-readable rendering of the condition, e.g. "to be equal to 3"
        expected: String,
        /// The stream version the condition was evaluated against
        actual: u64,
    },

    /// A non-trivial write condition was given to a store without version bookkeeping
    #[error("Write condition is not supported: {0}")]
    WriteConditionNotSupported(String),

    /// Inserting the batch violated the unique index over (streamid, id)
    #[error("Duplicate event id: {0}")]
    DuplicateEventId(String),

    /// Event time carries sub-millisecond precision under the Date representation
    #[error("Invalid time precision: {0}")]
    InvalidTimePrecision(String),

    /// Event time is not in UTC under the Date representation
    #[error("Invalid time zone: {0}")]
    InvalidTimeZone(String),

    /// A stored document could not be converted to or from a CloudEvent
    #[error("Malformed event document: {0}")]
    MalformedDocument(String),

    /// The underlying MongoDB deployment is unreachable or aborted transiently
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    /// A subscription could not be established or permanently lost its cursor
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
}

/// Result type for event store operations
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Whether a driver error is a unique-index violation (server code 11000),
/// in either the single-write or the insert-many shape.
pub(crate) fn is_duplicate_key(err: &MongoError) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::InsertMany(insert_error) => insert_error
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == 11000)),
        _ => false,
    }
}

impl From<MongoError> for EventStoreError {
    fn from(err: MongoError) -> Self {
        if is_duplicate_key(&err) {
            EventStoreError::DuplicateEventId(err.to_string())
        } else {
            EventStoreError::StoreUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        EventStoreError::MalformedDocument(err.to_string())
    }
}
