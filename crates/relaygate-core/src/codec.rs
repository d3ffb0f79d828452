//! CBOR framing for named events.
//!
//! Each event travels as one transport message holding a CBOR array
//! `[event_name, arg0, arg1, ...]`.

use std::io::Cursor;

use ciborium::Value;

use crate::error::{GatewayError, GatewayResult};

/// A decoded named event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event: String,
    pub args: Vec<Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }
}

/// Encode a named event into a CBOR message.
pub fn encode_event(frame: &EventFrame) -> GatewayResult<Vec<u8>> {
    let mut items = Vec::with_capacity(1 + frame.args.len());
    items.push(Value::Text(frame.event.clone()));
    items.extend(frame.args.iter().cloned());

    let mut out = Vec::new();
    ciborium::into_writer(&Value::Array(items), &mut out)?;
    Ok(out)
}

/// Decode a CBOR message into a named event.
pub fn decode_event(data: &[u8]) -> GatewayResult<EventFrame> {
    let value: Value = ciborium::from_reader(Cursor::new(data))?;
    let mut items = match value {
        Value::Array(items) => items,
        _ => return Err(GatewayError::Codec("event frame is not an array".into())),
    };
    if items.is_empty() {
        return Err(GatewayError::Codec("empty event frame".into()));
    }
    let event = match items.remove(0) {
        Value::Text(name) => name,
        _ => return Err(GatewayError::Codec("event name is not text".into())),
    };
    Ok(EventFrame { event, args: items })
}

/// Convert an opaque CBOR payload into JSON for consumers.
///
/// Byte strings become arrays of numbers and non-text map keys are
/// stringified; tags are dropped.
pub fn cbor_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                Json::from(v)
            } else if let Ok(v) = u64::try_from(n) {
                Json::from(v)
            } else {
                Json::String(n.to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
        Value::Array(items) => Json::Array(items.iter().map(cbor_to_json).collect()),
        Value::Map(entries) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in entries {
                let key = match k {
                    Value::Text(s) => s.clone(),
                    other => cbor_to_json(other).to_string(),
                };
                obj.insert(key, cbor_to_json(v));
            }
            Json::Object(obj)
        }
        Value::Tag(_, inner) => cbor_to_json(inner),
        _ => Json::Null,
    }
}

/// Render an opaque identifier (user id, contract) as a query-safe string.
pub fn cbor_to_string(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => cbor_to_json(other).to_string(),
    }
}
