//! Append-only CloudEvents event store and change subscriptions over MongoDB
//!
//! This library stores domain events packaged as CloudEvents in ordered,
//! append-only streams and tails the global event feed through resumable
//! subscriptions:
//!
//! - **Event streams**: write batches of events addressed by a stream id,
//!   guarded by a boolean algebra over the stream's version; read them back
//!   lazily in insertion order.
//! - **Consistency strategies**: no bookkeeping, store-managed transactions,
//!   or caller-owned (ambient) transactions, selected per store instance.
//! - **Subscriptions**: a position-aware tail of the change feed with durable
//!   resume points, server-side filtering, retry with backoff, cancellation
//!   and shutdown.
//!
//! # Architecture
//!
//! ```text
//! application ──► MongoEventStore ──► events collection ──► change feed
//!                       │                                        │
//!                       └─► versions collection                  ▼
//!                                                       SubscriptionEngine
//!                                                                │
//!                                              PositionStore ◄───┴──► action
//! ```
//!
//! # Modules
//!
//! - [`store`] - The event store: write, read, exists, stream version
//! - [`condition`] - Write conditions over the stream version
//! - [`consistency`] - Stream-consistency strategies
//! - [`event`] - CloudEvent envelope and event formats
//! - [`document`] - CloudEvent ↔ document mapping
//! - [`subscription`] - Resumable change subscriptions
//! - [`filter`] - Server-side subscription filters
//! - [`feed`] - Change feed positions
//! - [`errors`] - Error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use everstream::condition::eq;
//! use everstream::{CloudEvent, MongoEventStore, WriteCondition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoEventStore::connect("mongodb://localhost:27017", "events").await?;
//!
//!     let event = CloudEvent::builder("e1", "https://example.org/registry", "NameDefined")
//!         .data(serde_json::json!({ "name": "John Doe" }))
//!         .build();
//!     store
//!         .write_conditionally("name", WriteCondition::stream_version(eq(0)), [event])
//!         .await?;
//!
//!     let stream = store.read("name").await?;
//!     assert_eq!(stream.version, 1);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod condition;
pub mod consistency;
pub mod document;
pub mod errors;
pub mod event;
pub mod feed;
pub mod filter;
pub mod store;
pub mod subscription;

// Re-export commonly used types
pub use condition::{VersionPredicate, WriteCondition};
pub use consistency::ConsistencyGuarantee;
pub use document::TimeRepresentation;
pub use errors::{EventStoreError, EventStoreResult};
pub use event::{
    CloudEvent, CloudEventBuilder, EventFormat, JsonEventFormat, STREAM_ID_ATTRIBUTE,
    STREAM_POSITION_ATTRIBUTE,
};
pub use feed::{StartAt, SubscriptionPosition};
pub use filter::{FilterComparison, SubscriptionFilter};
pub use store::{EventStoreConfig, EventStream, MongoEventStore};
pub use subscription::{
    ActionError, ActionFn, EventAction, InMemoryPositionStore, MongoPositionStore, PositionStore,
    RetryPolicy, SubscriptionConfig, SubscriptionEngine, SubscriptionHandle, SubscriptionState,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
