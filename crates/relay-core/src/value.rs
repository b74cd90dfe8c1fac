//! Decoding of tagged wire values into BSON.
//!
//! The decoder is pure and deterministic and never fails: short or malformed
//! scalar payloads decode to whatever their bit pattern yields.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::record::{Field, WireValue};

/// Decode one wire value into its BSON form.
///
/// Numeric scalars are little-endian and fixed width. BSON has no unsigned
/// 64-bit type, so `Uint64` keeps its two's-complement bit pattern inside an
/// `Int64`. Map keys keep their input order.
pub fn decode(value: &WireValue) -> Bson {
    match value {
        WireValue::Float64(data) => Bson::Double(f64::from_le_bytes(scalar8(data))),
        WireValue::Int64(data) => Bson::Int64(i64::from_le_bytes(scalar8(data))),
        WireValue::Uint64(data) => Bson::Int64(u64::from_le_bytes(scalar8(data)) as i64),
        WireValue::Boolean(data) => Bson::Boolean(data.first().is_some_and(|b| b & 1 == 1)),
        WireValue::String(data) => Bson::String(String::from_utf8_lossy(data).into_owned()),
        WireValue::Map(fields) => Bson::Document(decode_fields(fields)),
        WireValue::Array(items) => Bson::Array(items.iter().map(decode).collect()),
        WireValue::Binary(data) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: data.clone(),
        }),
    }
}

/// Decode an ordered field list into a document, preserving field order.
pub fn decode_fields(fields: &[Field]) -> Document {
    let mut doc = Document::new();
    for field in fields {
        doc.insert(field.name.clone(), decode(&field.value));
    }
    doc
}

// Short payloads are zero-extended, oversized ones truncated.
fn scalar8(data: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    let n = data.len().min(8);
    buf[..n].copy_from_slice(&data[..n]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int64(v: i64) -> WireValue {
        WireValue::Int64(v.to_le_bytes().to_vec())
    }

    fn uint64(v: u64) -> WireValue {
        WireValue::Uint64(v.to_le_bytes().to_vec())
    }

    fn float64(v: f64) -> WireValue {
        WireValue::Float64(v.to_le_bytes().to_vec())
    }

    #[test]
    fn decodes_scalar_tags() {
        assert_eq!(
            decode(&WireValue::Int64(vec![1, 0, 0, 0, 0, 0, 0, 0])),
            Bson::Int64(1)
        );
        assert_eq!(decode(&WireValue::Boolean(vec![0x03])), Bson::Boolean(true));
        assert_eq!(decode(&float64(1.5)), Bson::Double(1.5));
    }

    #[test]
    fn scalar_tags_round_trip() {
        for v in [0i64, 1, -1, i64::MIN, i64::MAX] {
            assert_eq!(decode(&int64(v)), Bson::Int64(v));
        }
        for v in [0.0f64, -2.25, f64::MAX] {
            assert_eq!(decode(&float64(v)), Bson::Double(v));
        }
        assert_eq!(
            decode(&WireValue::String("héllo".as_bytes().to_vec())),
            Bson::String("héllo".to_string())
        );
        assert_eq!(decode(&WireValue::Boolean(vec![0])), Bson::Boolean(false));
        assert_eq!(decode(&WireValue::Boolean(vec![1])), Bson::Boolean(true));
    }

    #[test]
    fn uint64_keeps_bit_pattern() {
        assert_eq!(decode(&uint64(7)), Bson::Int64(7));
        assert_eq!(decode(&uint64(u64::MAX)), Bson::Int64(-1));
    }

    #[test]
    fn short_scalars_zero_extend() {
        assert_eq!(decode(&WireValue::Int64(vec![0x02, 0x01])), Bson::Int64(0x0102));
        assert_eq!(decode(&WireValue::Int64(vec![])), Bson::Int64(0));
        assert_eq!(decode(&WireValue::Boolean(vec![])), Bson::Boolean(false));
    }

    #[test]
    fn map_preserves_field_order() {
        let value = WireValue::Map(vec![
            Field {
                name: "z".to_string(),
                value: int64(1),
            },
            Field {
                name: "a".to_string(),
                value: int64(2),
            },
        ]);
        let Bson::Document(doc) = decode(&value) else {
            panic!("expected a document");
        };
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn array_has_no_leading_nulls() {
        let value = WireValue::Array(vec![int64(1), int64(2), int64(3)]);
        assert_eq!(
            decode(&value),
            Bson::Array(vec![Bson::Int64(1), Bson::Int64(2), Bson::Int64(3)])
        );
    }

    #[test]
    fn unknown_tags_stay_opaque() {
        // "timestamp" is no tag this sink interprets; the field still
        // deserializes and decodes to opaque bytes instead of erroring.
        let field: Field = serde_json::from_str(
            r#"{"name": "seen_at", "value": {"timestamp": [1, 2, 3]}}"#,
        )
        .unwrap();
        assert_eq!(
            decode(&field.value),
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![1, 2, 3],
            })
        );

        let decoded = decode(&WireValue::Binary(vec![0xde, 0xad]));
        assert_eq!(
            decoded,
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![0xde, 0xad],
            })
        );
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let decoded = decode(&WireValue::String(vec![0x66, 0xff, 0x6f]));
        assert_eq!(decoded, Bson::String("f\u{fffd}o".to_string()));
    }
}
