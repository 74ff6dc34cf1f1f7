//! MongoDB-backed CloudEvents event store
//!
//! Streams are ordered, append-only sequences of CloudEvents sharing a
//! `streamid`. Writes append a batch of events; reads return the stream's
//! version together with a lazy sequence of its events.
//!
//! ```text
//! write ──► encode ──► events collection ──► change feed ──► subscriptions
//!              │
//!              └──► versions collection (Transactional guarantees)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use everstream::{CloudEvent, MongoEventStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoEventStore::connect("mongodb://localhost:27017", "events").await?;
//!
//!     let event = CloudEvent::builder("e1", "https://example.org/registry", "NameDefined")
//!         .data(serde_json::json!({ "name": "John Doe" }))
//!         .build();
//!     store.write("name", [event]).await?;
//!
//!     let stream = store.read("name").await?;
//!     println!("stream at version {}", stream.version);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::error::{
    Error as MongoError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::condition::WriteCondition;
use crate::consistency::ConsistencyGuarantee;
use crate::document::{decode, encode, TimeRepresentation, SEQUENCE_FIELD};
use crate::errors::{is_duplicate_key, EventStoreError, EventStoreResult};
use crate::event::{CloudEvent, EventFormat, JsonEventFormat, STREAM_ID_ATTRIBUTE};
use crate::subscription::SubscriptionConfig;

/// Configuration for [`MongoEventStore`]
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Collection holding one document per event
    pub events_collection: String,

    /// How the `time` attribute is persisted
    pub time_representation: TimeRepresentation,

    /// Stream-consistency strategy applied to writes
    pub guarantee: ConsistencyGuarantee,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            events_collection: "events".to_string(),
            time_representation: TimeRepresentation::Rfc3339String,
            guarantee: ConsistencyGuarantee::transactional(),
        }
    }
}

/// Result of reading a stream
///
/// The event sequence is lazy and single-pass; the underlying cursor is
/// closed when the sequence ends or the stream is dropped.
pub struct EventStream {
    /// The stream id the events were read from
    pub id: String,

    /// Number of committed append batches, 0 under the `None` guarantee
    pub version: u64,

    /// The stream's events in insertion order
    pub events: BoxStream<'static, EventStoreResult<CloudEvent>>,
}

impl EventStream {
    /// Drain the event sequence into a vector
    pub async fn collect(self) -> EventStoreResult<Vec<CloudEvent>> {
        self.events.try_collect().await
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Per-stream version record, one document per stream
#[derive(Debug, Serialize, Deserialize)]
struct StreamVersionDocument {
    #[serde(rename = "streamid")]
    stream_id: String,
    version: i64,
}

/// Append-only CloudEvents store over a MongoDB collection
pub struct MongoEventStore {
    client: Client,
    database: Database,
    events: Collection<Document>,
    config: EventStoreConfig,
    format: Arc<dyn EventFormat>,
}

impl MongoEventStore {
    /// Connect with the default configuration
    pub async fn connect(uri: &str, database: &str) -> EventStoreResult<Self> {
        Self::connect_with_config(uri, database, EventStoreConfig::default()).await
    }

    /// Connect with a custom configuration
    pub async fn connect_with_config(
        uri: &str,
        database: &str,
        config: EventStoreConfig,
    ) -> EventStoreResult<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name.get_or_insert_with(|| "everstream".to_string());
        let client = Client::with_options(options)?;
        Self::new(client, database, config).await
    }

    /// Build a store over an existing client
    ///
    /// Ensures the unique indexes over `(streamid, id)` on the event
    /// collection and `streamid` on the version collection.
    pub async fn new(
        client: Client,
        database: &str,
        config: EventStoreConfig,
    ) -> EventStoreResult<Self> {
        let database = client.database(database);
        let events = database.collection(&config.events_collection);
        let store = Self {
            client,
            database,
            events,
            config,
            format: Arc::new(JsonEventFormat),
        };
        store.ensure_indexes().await?;
        info!("Connected event store to database {}", store.database.name());
        Ok(store)
    }

    /// Use a non-default event format
    pub fn with_event_format(mut self, format: Arc<dyn EventFormat>) -> Self {
        self.format = format;
        self
    }

    /// The database this store writes to
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// The underlying client, e.g. for starting an ambient session
    ///
    /// Sessions passed to the `_in_session` methods must come from this
    /// client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Subscription-engine configuration matching this store's layout
    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            events_collection: self.config.events_collection.clone(),
            time_representation: self.config.time_representation,
            ..SubscriptionConfig::default()
        }
    }

    async fn ensure_indexes(&self) -> EventStoreResult<()> {
        let event_index = IndexModel::builder()
            .keys(doc! { STREAM_ID_ATTRIBUTE: 1, "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.events.create_index(event_index).await?;

        if let Some(name) = self.config.guarantee.version_collection() {
            let version_index = IndexModel::builder()
                .keys(doc! { STREAM_ID_ATTRIBUTE: 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build();
            self.versions(name).create_index(version_index).await?;
        }

        debug!("Ensured event store indexes");
        Ok(())
    }

    fn versions(&self, collection: &str) -> Collection<StreamVersionDocument> {
        self.database.collection(collection)
    }

    /// Append a batch of events to a stream
    pub async fn write(
        &self,
        stream_id: &str,
        events: impl IntoIterator<Item = CloudEvent>,
    ) -> EventStoreResult<()> {
        self.write_conditionally(stream_id, WriteCondition::AnyStreamVersion, events)
            .await
    }

    /// Append a batch of events, guarded by a write condition
    ///
    /// The (possibly lazy) input is fully consumed before any storage work.
    /// An empty batch is a no-op and does not advance the stream version.
    pub async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: impl IntoIterator<Item = CloudEvent>,
    ) -> EventStoreResult<()> {
        let documents = self.encode_batch(stream_id, events)?;

        match &self.config.guarantee {
            ConsistencyGuarantee::None => {
                if condition != WriteCondition::AnyStreamVersion {
                    return Err(EventStoreError::WriteConditionNotSupported(format!(
                        "the store tracks no stream versions, cannot require the version {condition}"
                    )));
                }
                if documents.is_empty() {
                    return Ok(());
                }
                self.events
                    .insert_many(&documents)
                    .await
                    .map_err(EventStoreError::from)?;
                debug!("Wrote {} events to stream {}", documents.len(), stream_id);
                Ok(())
            }
            ConsistencyGuarantee::Transactional { version_collection } => {
                if documents.is_empty() {
                    return Ok(());
                }
                self.write_transactional(stream_id, &condition, documents, version_collection)
                    .await
            }
            ConsistencyGuarantee::TransactionalAnnotation { version_collection } => {
                if documents.is_empty() {
                    return Ok(());
                }
                self.write_annotated(None, stream_id, &condition, documents, version_collection)
                    .await
            }
        }
    }

    /// Append a batch of events inside a caller-owned session
    pub async fn write_in_session(
        &self,
        session: &mut ClientSession,
        stream_id: &str,
        events: impl IntoIterator<Item = CloudEvent>,
    ) -> EventStoreResult<()> {
        self.write_conditionally_in_session(
            session,
            stream_id,
            WriteCondition::AnyStreamVersion,
            events,
        )
        .await
    }

    /// Conditionally append a batch of events inside a caller-owned session
    ///
    /// This is the ambient-transaction surface: the store performs the write
    /// pipeline's steps in the given session but neither starts nor commits a
    /// transaction. Under the Transactional guarantee the caller's session
    /// replaces the store-managed transaction.
    pub async fn write_conditionally_in_session(
        &self,
        session: &mut ClientSession,
        stream_id: &str,
        condition: WriteCondition,
        events: impl IntoIterator<Item = CloudEvent>,
    ) -> EventStoreResult<()> {
        let documents = self.encode_batch(stream_id, events)?;

        match &self.config.guarantee {
            ConsistencyGuarantee::None => {
                if condition != WriteCondition::AnyStreamVersion {
                    return Err(EventStoreError::WriteConditionNotSupported(format!(
                        "the store tracks no stream versions, cannot require the version {condition}"
                    )));
                }
                if documents.is_empty() {
                    return Ok(());
                }
                self.events
                    .insert_many(&documents)
                    .session(session)
                    .await
                    .map_err(EventStoreError::from)?;
                Ok(())
            }
            ConsistencyGuarantee::Transactional { version_collection }
            | ConsistencyGuarantee::TransactionalAnnotation { version_collection } => {
                if documents.is_empty() {
                    return Ok(());
                }
                self.write_annotated(
                    Some(session),
                    stream_id,
                    &condition,
                    documents,
                    version_collection,
                )
                .await
            }
        }
    }

    /// Read a whole stream
    pub async fn read(&self, stream_id: &str) -> EventStoreResult<EventStream> {
        self.read_range(stream_id, 0, u64::MAX).await
    }

    /// Read a slice of a stream
    ///
    /// `skip` and `limit` apply to the server-side ordered result. A missing
    /// stream yields version 0 and no events; `skip` beyond the stream's end
    /// yields no events and the correct version.
    pub async fn read_range(
        &self,
        stream_id: &str,
        skip: u64,
        limit: u64,
    ) -> EventStoreResult<EventStream> {
        match &self.config.guarantee {
            ConsistencyGuarantee::None => Ok(EventStream {
                id: stream_id.to_string(),
                version: 0,
                events: self.open_cursor(stream_id, skip, limit).await?,
            }),
            ConsistencyGuarantee::TransactionalAnnotation { version_collection } => {
                let version =
                    Self::version_lookup(&self.versions(version_collection), stream_id).await?;
                Ok(EventStream {
                    id: stream_id.to_string(),
                    version,
                    events: self.open_cursor(stream_id, skip, limit).await?,
                })
            }
            ConsistencyGuarantee::Transactional { version_collection } => {
                self.read_snapshot(stream_id, skip, limit, version_collection)
                    .await
            }
        }
    }

    /// Whether any events exist for the stream
    pub async fn exists(&self, stream_id: &str) -> EventStoreResult<bool> {
        let found = self
            .events
            .find_one(doc! { STREAM_ID_ATTRIBUTE: stream_id })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(found.is_some())
    }

    /// The stream's current version
    ///
    /// Always 0 under the `None` guarantee.
    pub async fn stream_version(&self, stream_id: &str) -> EventStoreResult<u64> {
        match self.config.guarantee.version_collection() {
            None => Ok(0),
            Some(collection) => Self::version_lookup(&self.versions(collection), stream_id).await,
        }
    }

    /// Encode the batch, draining the lazy input, and stamp each document
    /// with a monotonic sequence number preserving insertion order.
    fn encode_batch(
        &self,
        stream_id: &str,
        events: impl IntoIterator<Item = CloudEvent>,
    ) -> EventStoreResult<Vec<Document>> {
        let events: Vec<CloudEvent> = events.into_iter().collect();
        let base = Utc::now().timestamp_millis() * 1_000;

        events
            .iter()
            .enumerate()
            .map(|(index, event)| {
                let mut document = encode(
                    self.format.as_ref(),
                    self.config.time_representation,
                    stream_id,
                    event,
                )?;
                document.insert(SEQUENCE_FIELD, base + index as i64);
                Ok(document)
            })
            .collect()
    }

    /// Store-managed transaction: version lookup, condition evaluation,
    /// bulk insert and version advance commit or abort as a unit. Transient
    /// aborts retry the whole transaction, per the driver's error labels.
    async fn write_transactional(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
        documents: Vec<Document>,
        version_collection: &str,
    ) -> EventStoreResult<()> {
        let versions = self.versions(version_collection);
        let mut session = self.client.start_session().await?;

        'transaction: loop {
            session.start_transaction().await?;

            let current =
                match Self::version_in_session(&versions, &mut session, stream_id).await {
                    Ok(version) => version,
                    Err(e) => {
                        let _ = session.abort_transaction().await;
                        if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                            continue 'transaction;
                        }
                        return Err(e.into());
                    }
                };

            if !condition.eval(current) {
                let _ = session.abort_transaction().await;
                return Err(condition.not_fulfilled(current));
            }

            if let Err(e) = self.events.insert_many(&documents).session(&mut session).await {
                let _ = session.abort_transaction().await;
                if is_duplicate_key(&e) {
                    return Err(EventStoreError::DuplicateEventId(e.to_string()));
                }
                if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    continue 'transaction;
                }
                return Err(e.into());
            }

            if let Err(e) =
                Self::advance_version(&versions, Some(&mut session), stream_id, current + 1).await
            {
                let _ = session.abort_transaction().await;
                if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    continue 'transaction;
                }
                return Err(e.into());
            }

            loop {
                match session.commit_transaction().await {
                    Ok(()) => {
                        debug!("Wrote {} events to stream {}", documents.len(), stream_id);
                        return Ok(());
                    }
                    Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => continue,
                    Err(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR) => {
                        continue 'transaction;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// The ambient-transaction pipeline: version lookup, condition
    /// evaluation, version advance, then the bulk insert.
    ///
    /// The version advances before the insert. Inside an ambient transaction
    /// both steps commit together; without one a failed insert leaves the
    /// version ahead of the visible events, the documented anomaly of the
    /// TransactionalAnnotation guarantee.
    async fn write_annotated(
        &self,
        mut session: Option<&mut ClientSession>,
        stream_id: &str,
        condition: &WriteCondition,
        documents: Vec<Document>,
        version_collection: &str,
    ) -> EventStoreResult<()> {
        let versions = self.versions(version_collection);

        let current = match session.as_deref_mut() {
            Some(s) => Self::version_in_session(&versions, s, stream_id).await?,
            None => Self::version_lookup(&versions, stream_id).await?,
        };

        if !condition.eval(current) {
            return Err(condition.not_fulfilled(current));
        }

        Self::advance_version(&versions, session.as_deref_mut(), stream_id, current + 1).await?;

        let insert = self.events.insert_many(&documents);
        let result = match session.as_deref_mut() {
            Some(s) => insert.session(s).await,
            None => insert.await,
        };
        result.map_err(EventStoreError::from)?;

        debug!("Wrote {} events to stream {}", documents.len(), stream_id);
        Ok(())
    }

    /// Point-in-time read: version and events come from one transaction
    /// snapshot. The transaction ends when the event sequence is drained or
    /// dropped.
    async fn read_snapshot(
        &self,
        stream_id: &str,
        skip: u64,
        limit: u64,
        version_collection: &str,
    ) -> EventStoreResult<EventStream> {
        let versions = self.versions(version_collection);
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let version = Self::version_in_session(&versions, &mut session, stream_id)
            .await
            .map_err(EventStoreError::from)?;

        let mut find = self
            .events
            .find(doc! { STREAM_ID_ATTRIBUTE: stream_id })
            .sort(doc! { SEQUENCE_FIELD: 1, "_id": 1 });
        if skip > 0 {
            find = find.skip(skip);
        }
        if limit != u64::MAX {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let cursor = find.session(&mut session).await?;

        let format = Arc::clone(&self.format);
        let representation = self.config.time_representation;
        let events = stream::try_unfold(
            (cursor, session),
            move |(mut cursor, mut session)| {
                let format = Arc::clone(&format);
                async move {
                    match cursor.next(&mut session).await {
                        Some(Ok(document)) => {
                            let event = decode(format.as_ref(), representation, document)?;
                            Ok(Some((event, (cursor, session))))
                        }
                        Some(Err(e)) => Err(EventStoreError::from(e)),
                        None => {
                            // Read-only transaction; committing releases the snapshot.
                            let _ = session.commit_transaction().await;
                            Ok(None)
                        }
                    }
                }
            },
        )
        .boxed();

        Ok(EventStream {
            id: stream_id.to_string(),
            version,
            events,
        })
    }

    async fn open_cursor(
        &self,
        stream_id: &str,
        skip: u64,
        limit: u64,
    ) -> EventStoreResult<BoxStream<'static, EventStoreResult<CloudEvent>>> {
        let mut find = self
            .events
            .find(doc! { STREAM_ID_ATTRIBUTE: stream_id })
            .sort(doc! { SEQUENCE_FIELD: 1, "_id": 1 });
        if skip > 0 {
            find = find.skip(skip);
        }
        if limit != u64::MAX {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let cursor = find.await?;

        let format = Arc::clone(&self.format);
        let representation = self.config.time_representation;
        Ok(cursor
            .map_err(EventStoreError::from)
            .and_then(move |document| {
                let format = Arc::clone(&format);
                async move { decode(format.as_ref(), representation, document) }
            })
            .boxed())
    }

    async fn version_in_session(
        versions: &Collection<StreamVersionDocument>,
        session: &mut ClientSession,
        stream_id: &str,
    ) -> Result<u64, MongoError> {
        let record = versions
            .find_one(doc! { STREAM_ID_ATTRIBUTE: stream_id })
            .session(session)
            .await?;
        Ok(record.map(|r| r.version.max(0) as u64).unwrap_or(0))
    }

    async fn version_lookup(
        versions: &Collection<StreamVersionDocument>,
        stream_id: &str,
    ) -> EventStoreResult<u64> {
        let record = versions
            .find_one(doc! { STREAM_ID_ATTRIBUTE: stream_id })
            .await?;
        Ok(record.map(|r| r.version.max(0) as u64).unwrap_or(0))
    }

    async fn advance_version(
        versions: &Collection<StreamVersionDocument>,
        session: Option<&mut ClientSession>,
        stream_id: &str,
        next: u64,
    ) -> Result<(), MongoError> {
        let update = versions
            .update_one(
                doc! { STREAM_ID_ATTRIBUTE: stream_id },
                doc! { "$set": { "version": next as i64 } },
            )
            .upsert(true);

        match session {
            Some(s) => update.session(s).await.map(|_| ()),
            None => update.await.map(|_| ()),
        }
    }
}
