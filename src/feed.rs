//! Change feed adapter
//!
//! Wraps the MongoDB change stream of the event collection. The feed is
//! restricted server-side to inserts, optionally narrowed by a
//! [`SubscriptionFilter`], and yields each inserted document decoded back
//! into a [`CloudEvent`] together with the notification's resume token.
//!
//! Resume tokens are opaque: they are carried as [`SubscriptionPosition`]
//! values, converted to and from the driver's token type only through BSON
//! serialization, and never inspected.

use std::sync::Arc;

use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Collection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::document::{decode, TimeRepresentation};
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::{CloudEvent, EventFormat, STREAM_POSITION_ATTRIBUTE};
use crate::filter::SubscriptionFilter;

/// Opaque position in the global event feed
///
/// Structurally this is the resume token issued by the change feed. The core
/// stores and replays it byte-for-byte and never interprets its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPosition(Document);

impl SubscriptionPosition {
    /// Rehydrate a position from its stored document form
    pub fn from_document(document: Document) -> Self {
        SubscriptionPosition(document)
    }

    /// The stored document form of this position
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub(crate) fn from_resume_token(token: &ResumeToken) -> EventStoreResult<Self> {
        bson::to_document(token)
            .map(SubscriptionPosition)
            .map_err(|e| EventStoreError::SubscriptionFailed(e.to_string()))
    }

    pub(crate) fn to_resume_token(&self) -> EventStoreResult<ResumeToken> {
        bson::from_document(self.0.clone())
            .map_err(|e| EventStoreError::SubscriptionFailed(e.to_string()))
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        Bson::Document(self.0.clone()).into_relaxed_extjson()
    }
}

/// Where a subscription starts delivering from
#[derive(Debug, Clone, PartialEq)]
pub enum StartAt {
    /// Start at the current tail of the feed
    Now,
    /// Resume from a previously captured position
    Position(SubscriptionPosition),
}

impl StartAt {
    /// Start at the current tail of the feed
    pub fn now() -> Self {
        StartAt::Now
    }

    /// Resume from a previously captured position
    pub fn position(position: SubscriptionPosition) -> Self {
        StartAt::Position(position)
    }
}

/// Whether the server permanently rejected the cursor or its resume token.
///
/// Covers InvalidResumeToken (260), ChangeStreamFatalError (280) and
/// ChangeStreamHistoryLost (286); everything else is worth a reconnect.
fn is_permanent_cursor_failure(err: &MongoError) -> bool {
    matches!(&*err.kind, ErrorKind::Command(c) if matches!(c.code, 260 | 280 | 286))
}

fn classify(err: MongoError) -> EventStoreError {
    if is_permanent_cursor_failure(&err) {
        EventStoreError::SubscriptionFailed(err.to_string())
    } else {
        EventStoreError::StoreUnavailable(err.to_string())
    }
}

/// Factory for change-stream cursors over the event collection
pub(crate) struct ChangeFeed {
    collection: Collection<Document>,
    format: Arc<dyn EventFormat>,
    time_representation: TimeRepresentation,
}

impl ChangeFeed {
    pub(crate) fn new(
        collection: Collection<Document>,
        format: Arc<dyn EventFormat>,
        time_representation: TimeRepresentation,
    ) -> Self {
        Self {
            collection,
            format,
            time_representation,
        }
    }

    /// Open a cursor, optionally narrowed by a filter and resuming after a
    /// previously captured position.
    pub(crate) async fn open(
        &self,
        filter: Option<&SubscriptionFilter>,
        start_after: Option<&SubscriptionPosition>,
    ) -> EventStoreResult<FeedCursor> {
        let mut pipeline = vec![doc! { "$match": { "operationType": "insert" } }];
        if let Some(filter) = filter {
            pipeline.push(doc! { "$match": filter.to_match_filter(self.time_representation) });
        }

        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .start_after(start_after.map(SubscriptionPosition::to_resume_token).transpose()?)
            .build();

        let stream = self
            .collection
            .watch()
            .pipeline(pipeline)
            .with_options(options)
            .await
            .map_err(classify)?;

        Ok(FeedCursor {
            stream,
            format: Arc::clone(&self.format),
            time_representation: self.time_representation,
        })
    }
}

/// An open change-stream cursor yielding decoded events
pub(crate) struct FeedCursor {
    stream: ChangeStream<ChangeStreamEvent<Document>>,
    format: Arc<dyn EventFormat>,
    time_representation: TimeRepresentation,
}

impl FeedCursor {
    /// The cursor's current position, available as soon as the cursor is open
    pub(crate) fn position(&self) -> Option<SubscriptionPosition> {
        self.stream
            .resume_token()
            .and_then(|token| SubscriptionPosition::from_resume_token(&token).ok())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.stream.is_alive()
    }

    /// The next inserted event, if one is currently available
    ///
    /// Returns `Ok(None)` at batch boundaries and for notifications that
    /// carry no decodable insert, so callers can observe cancellation between
    /// polls.
    pub(crate) async fn try_next(
        &mut self,
    ) -> EventStoreResult<Option<(CloudEvent, SubscriptionPosition)>> {
        let Some(notification) = self.stream.next_if_any().await.map_err(classify)? else {
            return Ok(None);
        };

        if notification.operation_type != OperationType::Insert {
            return Ok(None);
        }

        let Some(document) = notification.full_document else {
            warn!("insert notification without a full document, skipping");
            return Ok(None);
        };

        // The cached token resumes after the most recently returned change.
        let token = self.stream.resume_token().ok_or_else(|| {
            EventStoreError::SubscriptionFailed(
                "change stream returned an event without a resume token".to_string(),
            )
        })?;
        let position = SubscriptionPosition::from_resume_token(&token)?;
        let mut event = decode(self.format.as_ref(), self.time_representation, document)?;
        event.set_extension(STREAM_POSITION_ATTRIBUTE, position.to_json());

        Ok(Some((event, position)))
    }
}
