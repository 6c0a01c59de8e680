//! Events in the shape of Fluentd's [Message Mode].
//!
//! [Message Mode]:
//! https://github.com/fluent/fluentd/wiki/Forward-Protocol-Specification-v1#message-modes

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// The structured payload of an event. Always a JSON object.
pub type Record = Map<String, Value>;

/// A routable event: a tag, a time in seconds since the Unix epoch, and a
/// record.
///
/// Serialized to MessagePack with [`Event::to_msgpack`], it is the
/// `[tag, time, record]` array of Message Mode.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub tag: String,
    pub time: i64,
    pub record: Record,
}

impl Event {
    /// Encodes the event as a Message Mode array.
    ///
    /// Numbers are written as MessagePack integers or floats. An integer
    /// outside the 64-bit range is written as its decimal string.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be represented in MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(&(&self.tag, self.time, Packed::Object(&self.record)))
    }
}

/// A JSON value serialized with plain numbers.
///
/// `serde_json` keeps numbers as their source text, and serializes them to
/// formats other than JSON as a wrapper map.
#[derive(Clone, Copy)]
enum Packed<'a> {
    Object(&'a Record),
    Value(&'a Value),
}

impl Serialize for Packed<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match *self {
            Packed::Object(record) => {
                return serializer.collect_map(record.iter().map(|(k, v)| (k, Packed::Value(v))))
            }
            Packed::Value(value) => value,
        };
        match value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serialize_number(n, serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => serializer.collect_seq(items.iter().map(Packed::Value)),
            Value::Object(record) => Packed::Object(record).serialize(serializer),
        }
    }
}

fn serialize_number<S: Serializer>(n: &Number, serializer: S) -> Result<S::Ok, S::Error> {
    if let Some(n) = n.as_u64() {
        serializer.serialize_u64(n)
    } else if let Some(n) = n.as_i64() {
        serializer.serialize_i64(n)
    } else if let Some(f) = n.as_f64().filter(|_| n.is_f64()) {
        serializer.serialize_f64(f)
    } else {
        serializer.serialize_str(&n.to_string())
    }
}
