//! Row-level change events as delivered by the upstream bus.

use std::fmt;

use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// The mutation kind of a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Insert,
    Update,
    Delete,
}

/// One named column of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: WireValue,
}

/// Tagged wire value attached to a field
///
/// Scalars carry their raw little-endian bytes; `Map` and `Array` nest.
/// `Binary` is the catch-all for tags the sink does not interpret: a tag
/// outside this set deserializes into it as an opaque byte sequence rather
/// than failing the whole delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    Float64(Vec<u8>),
    Int64(Vec<u8>),
    Uint64(Vec<u8>),
    Boolean(Vec<u8>),
    String(Vec<u8>),
    Map(Vec<Field>),
    Array(Vec<WireValue>),
    Binary(Vec<u8>),
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TagVisitor;

        impl<'de> Visitor<'de> for TagVisitor {
            type Value = WireValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a tagged wire value")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let Some(tag) = map.next_key::<String>()? else {
                    return Err(serde::de::Error::custom("missing wire value tag"));
                };
                let value = match tag.as_str() {
                    "float64" => WireValue::Float64(map.next_value()?),
                    "int64" => WireValue::Int64(map.next_value()?),
                    "uint64" => WireValue::Uint64(map.next_value()?),
                    "boolean" => WireValue::Boolean(map.next_value()?),
                    "string" => WireValue::String(map.next_value()?),
                    "map" => WireValue::Map(map.next_value()?),
                    "array" => WireValue::Array(map.next_value()?),
                    "binary" => WireValue::Binary(map.next_value()?),
                    // Unrecognized tag: keep the payload as opaque bytes.
                    _ => WireValue::Binary(opaque_bytes(map.next_value()?)),
                };
                while map.next_key::<IgnoredAny>()?.is_some() {
                    map.next_value::<IgnoredAny>()?;
                }
                Ok(value)
            }
        }

        deserializer.deserialize_map(TagVisitor)
    }
}

// Raw bytes for a payload whose tag the sink does not know. Byte arrays and
// strings keep their content; anything else keeps its serialized text.
fn opaque_bytes(payload: serde_json::Value) -> Vec<u8> {
    match payload {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().unwrap_or(0) as u8)
            .collect(),
        serde_json::Value::String(s) => s.into_bytes(),
        serde_json::Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    }
}

/// A logical row mutation
///
/// `table` is the routing key into the subscription rule table; `primary_key`
/// names the identity field and may be empty, in which case UPDATE and DELETE
/// records are dropped by the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub method: Method,
    #[serde(default)]
    pub event_name: String,
    pub table: String,
    #[serde(default)]
    pub primary_key: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// An initial-load snapshot row for one source collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub collection: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_uses_wire_spelling() {
        assert_eq!(serde_json::to_string(&Method::Insert).unwrap(), "\"INSERT\"");
        assert_eq!(
            serde_json::from_str::<Method>("\"DELETE\"").unwrap(),
            Method::Delete
        );
    }

    #[test]
    fn record_defaults_optional_parts() {
        let record: Record = serde_json::from_str(
            r#"{"method": "INSERT", "table": "accounts"}"#,
        )
        .unwrap();
        assert_eq!(record.method, Method::Insert);
        assert_eq!(record.table, "accounts");
        assert!(record.primary_key.is_empty());
        assert!(record.fields.is_empty());
    }

    #[test]
    fn known_tags_deserialize_to_their_variants() {
        let field: Field = serde_json::from_str(
            r#"{"name": "id", "value": {"int64": [1, 0, 0, 0, 0, 0, 0, 0]}}"#,
        )
        .unwrap();
        assert_eq!(
            field.value,
            WireValue::Int64(vec![1, 0, 0, 0, 0, 0, 0, 0])
        );

        let field: Field = serde_json::from_str(
            r#"{"name": "tags", "value": {"array": [{"string": [104, 105]}]}}"#,
        )
        .unwrap();
        assert_eq!(
            field.value,
            WireValue::Array(vec![WireValue::String(vec![104, 105])])
        );
    }

    #[test]
    fn unknown_tags_fall_back_to_opaque_bytes() {
        let field: Field = serde_json::from_str(
            r#"{"name": "seen_at", "value": {"timestamp": [1, 2, 3]}}"#,
        )
        .unwrap();
        assert_eq!(field.value, WireValue::Binary(vec![1, 2, 3]));

        let field: Field = serde_json::from_str(
            r#"{"name": "note", "value": {"varchar": "hi"}}"#,
        )
        .unwrap();
        assert_eq!(field.value, WireValue::Binary(vec![104, 105]));

        // One unrecognized tag must not poison the record around it.
        let record: Record = serde_json::from_str(
            r#"{
                "method": "INSERT",
                "table": "accounts",
                "fields": [
                    {"name": "id", "value": {"int64": [7, 0, 0, 0, 0, 0, 0, 0]}},
                    {"name": "seen_at", "value": {"timestamp": [1, 2, 3]}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.fields[1].value, WireValue::Binary(vec![1, 2, 3]));
    }
}
