//! Decoding of document-change payloads emitted by the hosted document store.
//!
//! A change carries the document before (`oldValue`) and after (`value`) the
//! write. Field values are typed wrappers such as `{"integerValue": "3"}`.
//! An empty `oldValue` means the document was created; an empty `value`
//! means it was deleted.

use crate::core::event::RatingWriteEvent;
use crate::core::path::RatingPath;
use crate::core::rating::RatingRecord;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Field names that may hold the rating, newest first
const VALUE_FIELDS: [&str; 2] = ["value", "rating"];

const WRITTEN_AT_FIELD: &str = "writtenAt";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentChange {
    #[serde(default)]
    old_value: Option<DocumentValue>,
    #[serde(default)]
    value: Option<DocumentValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentValue {
    #[serde(default)]
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    update_time: Option<String>,
}

impl DocumentValue {
    fn is_empty(&self) -> bool {
        self.name.is_empty() && self.fields.is_empty()
    }

    fn rating_value(&self) -> Option<f64> {
        VALUE_FIELDS
            .iter()
            .find_map(|field| self.fields.get(*field))
            .and_then(typed_number)
    }

    fn written_at(&self, missing: MissingWriteTime) -> Result<Timestamp> {
        if let Some(ts) = self
            .fields
            .get(WRITTEN_AT_FIELD)
            .and_then(|v| v.get("timestampValue"))
            .and_then(Value::as_str)
        {
            return Timestamp::parse_rfc3339(ts);
        }
        match (&self.update_time, missing) {
            (Some(ts), _) => Timestamp::parse_rfc3339(ts),
            (None, MissingWriteTime::StampNow) => Ok(Timestamp::now()),
            (None, MissingWriteTime::Reject) => Err(Error::MalformedInput(format!(
                "{} carries neither {WRITTEN_AT_FIELD} nor updateTime",
                self.name
            ))),
        }
    }
}

/// What to do with a new image that carries no write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingWriteTime {
    /// Use the current time
    #[default]
    StampNow,
    /// Fail with `MalformedInput`; replay markers need a stable time
    Reject,
}

/// Read a number out of a typed field value or a bare JSON number
fn typed_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(typed) => typed
            .get("integerValue")
            .or_else(|| typed.get("doubleValue"))
            .and_then(|inner| match inner {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            }),
        _ => None,
    }
}

/// Decode one document-change payload into a [`RatingWriteEvent`].
///
/// A prior image without a readable rating is treated as absent, so the write
/// counts as a first rating. A new image without one is `MalformedInput`.
pub fn decode_change(payload: &Value) -> Result<RatingWriteEvent> {
    decode_change_with(payload, MissingWriteTime::StampNow)
}

/// [`decode_change`] with an explicit rule for a new image without a write time
pub fn decode_change_with(payload: &Value, missing: MissingWriteTime) -> Result<RatingWriteEvent> {
    let change = DocumentChange::deserialize(payload)?;
    let before_doc = change.old_value.filter(|doc| !doc.is_empty());
    let after_doc = change.value.filter(|doc| !doc.is_empty());

    let name = after_doc
        .as_ref()
        .or(before_doc.as_ref())
        .map(|doc| doc.name.as_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidPath("document change carries no document name".into()))?;
    let path = RatingPath::parse(name)?;

    let before = match &before_doc {
        Some(doc) => doc
            .rating_value()
            .map(|value| Ok::<_, Error>(RatingRecord::new(value, doc.written_at(MissingWriteTime::StampNow)?)))
            .transpose()?,
        None => None,
    };

    let after = match &after_doc {
        Some(doc) => {
            let value = doc.rating_value().ok_or_else(|| {
                Error::MalformedInput(format!("{path} has no numeric rating field"))
            })?;
            Some(RatingRecord::new(value, doc.written_at(missing)?))
        }
        None => None,
    };

    Ok(RatingWriteEvent::new(path, before, after))
}

/// Decode a payload given as JSON text
pub fn decode_change_str(payload: &str, missing: MissingWriteTime) -> Result<RatingWriteEvent> {
    let value: Value = serde_json::from_str(payload)?;
    decode_change_with(&value, missing)
}
