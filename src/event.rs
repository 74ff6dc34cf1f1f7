//! CloudEvents v1 envelope and pluggable event formats
//!
//! The store accepts and returns [`CloudEvent`] values. An event carries the
//! context attributes of the CloudEvents specification v1 plus arbitrary
//! extension attributes. Two extension attributes have reserved names:
//!
//! - [`STREAM_ID_ATTRIBUTE`]: set by the store on every persisted event and
//!   stripped again when events leave the store.
//! - [`STREAM_POSITION_ATTRIBUTE`]: attached by the change feed so that
//!   subscribers can persist a resume point.
//!
//! Serialization to and from bytes goes through the [`EventFormat`] seam;
//! [`JsonEventFormat`] (UTF-8 JSON) is the default.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EventStoreResult;

/// The CloudEvents specification version produced by this crate
pub const SPEC_VERSION: &str = "1.0";

/// Extension attribute naming the stream an event belongs to
pub const STREAM_ID_ATTRIBUTE: &str = "streamid";

/// Extension attribute carrying the change-feed resume token of an event
pub const STREAM_POSITION_ATTRIBUTE: &str = "streamposition";

/// A CloudEvents v1 event envelope
///
/// Equality is structural; timestamps compare by instant, so an event read
/// back from the store compares equal to the event that was written even if
/// the offset was re-rendered along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Identifies the event; `source` + `id` is unique per distinct event
    pub id: String,

    /// Identifies the context in which the event happened
    pub source: String,

    /// CloudEvents specification version, "1.0"
    pub specversion: String,

    /// Describes the type of the originating occurrence
    #[serde(rename = "type")]
    pub event_type: String,

    /// Subject of the event in the context of the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Timestamp of when the occurrence happened, with offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<FixedOffset>>,

    /// Content type of `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    /// Schema that `data` adheres to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,

    /// The event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Extension attributes, serialized at the top level of the envelope
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl CloudEvent {
    /// Start building an event from the three required attributes
    pub fn builder(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> CloudEventBuilder {
        CloudEventBuilder::new(id, source, event_type)
    }

    /// Look up an extension attribute by name
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }

    pub(crate) fn set_extension(&mut self, name: &str, value: Value) {
        self.extensions.insert(name.to_string(), value);
    }
}

/// Builder for [`CloudEvent`]
///
/// ```rust
/// use everstream::CloudEvent;
///
/// let event = CloudEvent::builder("e1", "https://example.org/registry", "NameDefined")
///     .subject("name")
///     .data(serde_json::json!({ "name": "John Doe" }))
///     .build();
/// assert_eq!(event.specversion, "1.0");
/// ```
#[derive(Debug, Clone)]
pub struct CloudEventBuilder {
    event: CloudEvent,
}

impl CloudEventBuilder {
    /// Create a builder with the required attributes set
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            event: CloudEvent {
                id: id.into(),
                source: source.into(),
                specversion: SPEC_VERSION.to_string(),
                event_type: event_type.into(),
                subject: None,
                time: None,
                datacontenttype: None,
                dataschema: None,
                data: None,
                extensions: BTreeMap::new(),
            },
        }
    }

    /// Set the event subject
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.event.subject = Some(subject.into());
        self
    }

    /// Set the occurrence timestamp
    pub fn time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.event.time = Some(time);
        self
    }

    /// Set the content type of the payload
    pub fn datacontenttype(mut self, content_type: impl Into<String>) -> Self {
        self.event.datacontenttype = Some(content_type.into());
        self
    }

    /// Set the schema the payload adheres to
    pub fn dataschema(mut self, schema: impl Into<String>) -> Self {
        self.event.dataschema = Some(schema.into());
        self
    }

    /// Set the event payload
    pub fn data(mut self, data: Value) -> Self {
        self.event.data = Some(data);
        self
    }

    /// Set an extension attribute
    pub fn extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.event.extensions.insert(name.into(), value);
        self
    }

    /// Finish building
    pub fn build(self) -> CloudEvent {
        self.event
    }
}

/// Pluggable codec transforming a [`CloudEvent`] to and from bytes
///
/// The store serializes every event through its format before persisting it
/// and deserializes through the same format on every read, so a format
/// controls the persisted attribute spelling end to end.
pub trait EventFormat: Send + Sync {
    /// Serialize an event to bytes
    fn serialize(&self, event: &CloudEvent) -> EventStoreResult<Vec<u8>>;

    /// Deserialize an event from bytes
    fn deserialize(&self, bytes: &[u8]) -> EventStoreResult<CloudEvent>;
}

/// The default event format: the CloudEvents JSON format, UTF-8 encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventFormat;

impl EventFormat for JsonEventFormat {
    fn serialize(&self, event: &CloudEvent) -> EventStoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> EventStoreResult<CloudEvent> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
