//! CloudEvent ↔ MongoDB document mapping
//!
//! Every persisted event is the JSON form of the CloudEvent produced by the
//! configured [`EventFormat`](crate::event::EventFormat), parsed into a BSON
//! document and enriched with the `streamid` attribute and an internal
//! ordering field. The `time` attribute is stored in one of two mutually
//! exclusive representations, fixed per store instance:
//!
//! - [`TimeRepresentation::Rfc3339String`]: the RFC 3339 string produced by
//!   CloudEvent encoding, re-rendered with an explicit offset.
//! - [`TimeRepresentation::Date`]: a native BSON datetime (millisecond
//!   precision, UTC). Writes fail when the event time carries sub-millisecond
//!   precision or a non-UTC offset.

use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::{self, Bson, Document};

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::{CloudEvent, EventFormat, STREAM_ID_ATTRIBUTE};

/// How the `time` attribute is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepresentation {
    /// Store `time` as the RFC 3339 string produced by CloudEvent encoding
    Rfc3339String,
    /// Store `time` as a native BSON datetime (millisecond precision, UTC)
    Date,
}

/// Internal field holding the per-event insertion sequence number
pub(crate) const SEQUENCE_FIELD: &str = "seq";

/// Convert a CloudEvent into its stored document form
///
/// The event is serialized through `format`, parsed into a document, tagged
/// with the target `streamid`, and its `time` field rewritten according to
/// the chosen representation.
pub fn encode(
    format: &dyn EventFormat,
    time_representation: TimeRepresentation,
    stream_id: &str,
    event: &CloudEvent,
) -> EventStoreResult<Document> {
    let bytes = format.serialize(event)?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)?;
    let mut document = bson::to_document(&json)
        .map_err(|e| EventStoreError::MalformedDocument(e.to_string()))?;

    document.insert(STREAM_ID_ATTRIBUTE, stream_id);

    match time_representation {
        TimeRepresentation::Rfc3339String => {
            // Formats are free to drop or reshuffle the offset; re-render the
            // attribute in canonical explicit-offset form.
            if let Some(time) = &event.time {
                document.insert(
                    "time",
                    time.to_rfc3339_opts(SecondsFormat::AutoSi, false),
                );
            }
        }
        TimeRepresentation::Date => {
            if let Some(time) = &event.time {
                if time.timestamp_subsec_nanos() % 1_000_000 != 0 {
                    return Err(EventStoreError::InvalidTimePrecision(format!(
                        "the Date representation stores milliseconds; time {} has sub-millisecond precision",
                        time.to_rfc3339()
                    )));
                }
                if time.offset().local_minus_utc() != 0 {
                    return Err(EventStoreError::InvalidTimeZone(format!(
                        "the Date representation stores UTC; time {} has offset {}",
                        time.to_rfc3339(),
                        time.offset()
                    )));
                }
                document.insert(
                    "time",
                    Bson::DateTime(bson::DateTime::from_millis(time.timestamp_millis())),
                );
            }
        }
    }

    Ok(document)
}

/// Reconstitute a CloudEvent from its stored document form
///
/// Internal fields (`_id`, the ordering field and `streamid`) are stripped
/// before the document is handed to the format's deserializer.
pub fn decode(
    format: &dyn EventFormat,
    time_representation: TimeRepresentation,
    mut document: Document,
) -> EventStoreResult<CloudEvent> {
    document.remove("_id");
    document.remove(SEQUENCE_FIELD);
    document.remove(STREAM_ID_ATTRIBUTE);

    if time_representation == TimeRepresentation::Date {
        match document.get("time").cloned() {
            Some(Bson::DateTime(stored)) => {
                let millis = stored.timestamp_millis();
                let time = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                    EventStoreError::MalformedDocument(format!(
                        "stored time {millis} is out of range"
                    ))
                })?;
                document.insert("time", time.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
            Some(other) => {
                return Err(EventStoreError::MalformedDocument(format!(
                    "expected a native datetime in the time field, found {other}"
                )));
            }
            None => {}
        }
    }

    let bytes = serde_json::to_vec(&document)?;
    format.deserialize(&bytes)
}
