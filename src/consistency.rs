//! Stream-consistency guarantees
//!
//! The guarantee is a strategy selected per store instance and dispatched at
//! write time. It controls whether a stream version is tracked at all, and
//! whether the write pipeline runs inside a store-managed transaction.

/// How much consistency the write pipeline provides per stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyGuarantee {
    /// No stream-version bookkeeping.
    ///
    /// Writes are a single bulk insert; conditions other than
    /// `AnyStreamVersion` are rejected; reads always report version 0.
    /// Concurrent writes to the same stream are not serialized by the store.
    None,

    /// Store-managed multi-document transaction per write.
    ///
    /// Version lookup, condition evaluation, event insertion and the version
    /// advance commit or abort as a unit. Reads return a point-in-time
    /// snapshot of version and events.
    Transactional {
        /// Collection holding the per-stream `{ streamid, version }` records
        version_collection: String,
    },

    /// Transaction scope is owned by the caller.
    ///
    /// The store performs the same logical steps but neither starts nor
    /// commits a transaction; callers wrap the write in their own
    /// [`ClientSession`](mongodb::ClientSession) via
    /// [`write_conditionally_in_session`](crate::store::MongoEventStore::write_conditionally_in_session).
    /// Without an ambient transaction a failed bulk insert leaves the version
    /// advanced past the visible events. That anomaly is the documented cost
    /// of this variant.
    TransactionalAnnotation {
        /// Collection holding the per-stream `{ streamid, version }` records
        version_collection: String,
    },
}

impl ConsistencyGuarantee {
    /// Transactional guarantee with the default version collection name
    pub fn transactional() -> Self {
        ConsistencyGuarantee::Transactional {
            version_collection: "versions".to_string(),
        }
    }

    /// Ambient-transaction guarantee with the default version collection name
    pub fn transactional_annotation() -> Self {
        ConsistencyGuarantee::TransactionalAnnotation {
            version_collection: "versions".to_string(),
        }
    }

    /// The version collection, when this guarantee tracks versions
    pub(crate) fn version_collection(&self) -> Option<&str> {
        match self {
            ConsistencyGuarantee::None => None,
            ConsistencyGuarantee::Transactional { version_collection }
            | ConsistencyGuarantee::TransactionalAnnotation { version_collection } => {
                Some(version_collection)
            }
        }
    }
}
