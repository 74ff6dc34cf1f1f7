//! Subscription filters
//!
//! Filters restrict a subscription to a subset of the event feed and are
//! evaluated server-side inside the change-stream pipeline. The structured
//! form covers the CloudEvent context attributes; [`SubscriptionFilter::raw`]
//! accepts a vendor-native filter document for anything beyond that.
//!
//! ```rust
//! use everstream::filter::{FilterComparison, SubscriptionFilter};
//!
//! let filter = SubscriptionFilter::and([
//!     SubscriptionFilter::source(FilterComparison::Eq, "https://example.org/registry"),
//!     SubscriptionFilter::event_type(FilterComparison::Eq, "NameDefined"),
//! ]);
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::{self, doc, Bson, Document};

use crate::document::TimeRepresentation;
use crate::errors::{EventStoreError, EventStoreResult};

/// Comparison operator of a filter leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterComparison {
    /// Attribute equals the value
    Eq,
    /// Attribute differs from the value
    Ne,
    /// Attribute is less than the value
    Lt,
    /// Attribute is less than or equal to the value
    Lte,
    /// Attribute is greater than the value
    Gt,
    /// Attribute is greater than or equal to the value
    Gte,
}

impl FilterComparison {
    fn operator(self) -> &'static str {
        match self {
            FilterComparison::Eq => "$eq",
            FilterComparison::Ne => "$ne",
            FilterComparison::Lt => "$lt",
            FilterComparison::Lte => "$lte",
            FilterComparison::Gt => "$gt",
            FilterComparison::Gte => "$gte",
        }
    }
}

/// Server-side filter over the event feed
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionFilter {
    /// Compare the `id` attribute
    Id(FilterComparison, String),
    /// Compare the `type` attribute
    EventType(FilterComparison, String),
    /// Compare the `source` attribute
    Source(FilterComparison, String),
    /// Compare the `subject` attribute
    Subject(FilterComparison, String),
    /// Compare the `time` attribute
    Time(FilterComparison, DateTime<Utc>),
    /// All children must match
    And(Vec<SubscriptionFilter>),
    /// At least one child must match
    Or(Vec<SubscriptionFilter>),
    /// Vendor-native filter document, applied verbatim
    Raw(Document),
}

impl SubscriptionFilter {
    /// Compare the `id` attribute
    pub fn id(comparison: FilterComparison, value: impl Into<String>) -> Self {
        SubscriptionFilter::Id(comparison, value.into())
    }

    /// Compare the `type` attribute
    pub fn event_type(comparison: FilterComparison, value: impl Into<String>) -> Self {
        SubscriptionFilter::EventType(comparison, value.into())
    }

    /// Compare the `source` attribute
    pub fn source(comparison: FilterComparison, value: impl Into<String>) -> Self {
        SubscriptionFilter::Source(comparison, value.into())
    }

    /// Compare the `subject` attribute
    pub fn subject(comparison: FilterComparison, value: impl Into<String>) -> Self {
        SubscriptionFilter::Subject(comparison, value.into())
    }

    /// Compare the `time` attribute
    pub fn time(comparison: FilterComparison, value: DateTime<Utc>) -> Self {
        SubscriptionFilter::Time(comparison, value)
    }

    /// All of the given filters must match
    pub fn and(filters: impl IntoIterator<Item = SubscriptionFilter>) -> Self {
        SubscriptionFilter::And(filters.into_iter().collect())
    }

    /// At least one of the given filters must match
    pub fn or(filters: impl IntoIterator<Item = SubscriptionFilter>) -> Self {
        SubscriptionFilter::Or(filters.into_iter().collect())
    }

    /// Vendor-native filter document
    pub fn raw_document(filter: Document) -> Self {
        SubscriptionFilter::Raw(filter)
    }

    /// Vendor-native filter given as a JSON string
    pub fn raw(json: &str) -> EventStoreResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let document = bson::to_document(&value)
            .map_err(|e| EventStoreError::MalformedDocument(e.to_string()))?;
        Ok(SubscriptionFilter::Raw(document))
    }

    /// Lower the filter into a `$match` document over the inserted document
    ///
    /// Attribute paths are prefixed with `fullDocument.` because the filter
    /// runs against change notifications, not against the collection itself.
    /// Raw filters are applied verbatim; their author chooses the paths.
    pub(crate) fn to_match_filter(&self, time_representation: TimeRepresentation) -> Document {
        fn attribute(path: &str, comparison: FilterComparison, value: Bson) -> Document {
            let mut inner = Document::new();
            inner.insert(comparison.operator(), value);
            let mut filter = Document::new();
            filter.insert(format!("fullDocument.{path}"), inner);
            filter
        }

        match self {
            SubscriptionFilter::Id(cmp, value) => attribute("id", *cmp, Bson::from(value.clone())),
            SubscriptionFilter::EventType(cmp, value) => {
                attribute("type", *cmp, Bson::from(value.clone()))
            }
            SubscriptionFilter::Source(cmp, value) => {
                attribute("source", *cmp, Bson::from(value.clone()))
            }
            SubscriptionFilter::Subject(cmp, value) => {
                attribute("subject", *cmp, Bson::from(value.clone()))
            }
            SubscriptionFilter::Time(cmp, value) => {
                let stored = match time_representation {
                    TimeRepresentation::Date => Bson::DateTime(
                        bson::DateTime::from_millis(value.timestamp_millis()),
                    ),
                    TimeRepresentation::Rfc3339String => {
                        Bson::from(value.to_rfc3339_opts(SecondsFormat::AutoSi, false))
                    }
                };
                attribute("time", *cmp, stored)
            }
            SubscriptionFilter::And(children) => doc! {
                "$and": children
                    .iter()
                    .map(|f| Bson::Document(f.to_match_filter(time_representation)))
                    .collect::<Vec<_>>()
            },
            SubscriptionFilter::Or(children) => doc! {
                "$or": children
                    .iter()
                    .map(|f| Bson::Document(f.to_match_filter(time_representation)))
                    .collect::<Vec<_>>()
            },
            SubscriptionFilter::Raw(document) => document.clone(),
        }
    }
}
