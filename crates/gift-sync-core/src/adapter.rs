//! Mapping between local entities and remote documents.
//!
//! The document store encodes timestamps as `{ "seconds", "nanoseconds" }`
//! objects; locally they are RFC 3339 strings. Older documents written by
//! other clients may also carry `{ "_seconds", "_nanoseconds" }` objects or
//! epoch milliseconds, so decoding accepts all of them.

use crate::model::{Entity, EntityType};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Invalid timestamp in field {field}: {value}")]
    InvalidTimestamp { field: String, value: String },

    #[error("Malformed {entity_type} document: {message}")]
    Malformed {
        entity_type: EntityType,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Fields holding timestamps, across all record types.
pub const TIMESTAMP_FIELDS: &[&str] = &[
    "createdAt",
    "updatedAt",
    "receivedAt",
    "dueDate",
    "remindAt",
];

/// Encode an entity as a remote document.
pub fn encode_document(entity: &Entity) -> Result<Value> {
    let mut value = match entity {
        Entity::Gift(r) => serde_json::to_value(r),
        Entity::Person(r) => serde_json::to_value(r),
        Entity::Return(r) => serde_json::to_value(r),
        Entity::Reminder(r) => serde_json::to_value(r),
        Entity::Image(r) => serde_json::to_value(r),
    }
    .map_err(|e| AdapterError::Malformed {
        entity_type: entity.entity_type(),
        message: e.to_string(),
    })?;

    let fields = value.as_object_mut().ok_or(AdapterError::NotAnObject)?;
    for field in TIMESTAMP_FIELDS {
        if let Some(slot) = fields.get_mut(*field) {
            if let Some(text) = slot.as_str() {
                let ts = parse_rfc3339(field, text)?;
                *slot = encode_timestamp(ts);
            }
        }
    }
    Ok(value)
}

/// Decode a remote document of the given type.
pub fn decode_document(entity_type: EntityType, mut value: Value) -> Result<Entity> {
    let fields = value.as_object_mut().ok_or(AdapterError::NotAnObject)?;
    for field in TIMESTAMP_FIELDS {
        if let Some(slot) = fields.get_mut(*field) {
            if let Some(ts) = decode_timestamp(field, slot)? {
                *slot = Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true));
            }
        }
    }

    let malformed = |e: serde_json::Error| AdapterError::Malformed {
        entity_type,
        message: e.to_string(),
    };
    let entity = match entity_type {
        EntityType::Gift => Entity::Gift(serde_json::from_value(value).map_err(malformed)?),
        EntityType::Person => Entity::Person(serde_json::from_value(value).map_err(malformed)?),
        EntityType::Return => Entity::Return(serde_json::from_value(value).map_err(malformed)?),
        EntityType::Reminder => {
            Entity::Reminder(serde_json::from_value(value).map_err(malformed)?)
        }
        EntityType::Image => Entity::Image(serde_json::from_value(value).map_err(malformed)?),
    };
    Ok(entity)
}

pub fn encode_timestamp(ts: DateTime<Utc>) -> Value {
    json!({
        "seconds": ts.timestamp(),
        "nanoseconds": ts.timestamp_subsec_nanos(),
    })
}

/// Decode any supported timestamp encoding. `Ok(None)` for null.
fn decode_timestamp(field: &str, value: &Value) -> Result<Option<DateTime<Utc>>> {
    let invalid = || AdapterError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Null => Ok(None),
        Value::String(text) => parse_rfc3339(field, text).map(Some),
        Value::Number(n) => {
            let millis = n.as_i64().ok_or_else(invalid)?;
            DateTime::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(invalid)
        }
        Value::Object(map) => {
            let (secs, nanos) = seconds_pair(map, "seconds", "nanoseconds")
                .or_else(|| seconds_pair(map, "_seconds", "_nanoseconds"))
                .ok_or_else(invalid)?;
            let nanos = u32::try_from(nanos).map_err(|_| invalid())?;
            DateTime::from_timestamp(secs, nanos)
                .map(Some)
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

fn seconds_pair(map: &Map<String, Value>, secs: &str, nanos: &str) -> Option<(i64, i64)> {
    let s = map.get(secs)?.as_i64()?;
    let n = map.get(nanos).and_then(Value::as_i64).unwrap_or(0);
    Some((s, n))
}

fn parse_rfc3339(field: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AdapterError::InvalidTimestamp {
            field: field.to_string(),
            value: text.to_string(),
        })
}
