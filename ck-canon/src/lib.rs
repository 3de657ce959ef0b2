//! Canonical-JSON encoding: the exact byte stream every hash and signature in
//! the clearing kernel is computed over.
//!
//! Determinism is the sole contract: two structurally equal [`CanonicalValue`]
//! trees must yield byte-identical output on every platform, forever. This is
//! a hand-rolled encoder rather than a re-export of `serde_json` because
//! `serde_json::Value` admits floats, which canonical-JSON forbids outright.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("canonical-JSON forbids non-integer numerics (floats): {0}")]
    NonIntegerNumber(String),
    #[error("canonical-JSON forbids numbers outside the 64-bit signed range: {0}")]
    OutOfRange(String),
    #[error("invalid UTF-8 in canonical string")]
    InvalidUtf8,
}

/// A canonical-JSON tree: null, bool, 64-bit signed integer, UTF-8 string,
/// ordered sequence, or string-keyed mapping. No floats, ever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Seq(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    pub fn map() -> CanonicalMapBuilder {
        CanonicalMapBuilder(BTreeMap::new())
    }

    pub fn str(s: impl Into<String>) -> Self {
        CanonicalValue::Str(s.into())
    }

    pub fn seq(items: impl IntoIterator<Item = CanonicalValue>) -> Self {
        CanonicalValue::Seq(items.into_iter().collect())
    }
}

/// Small ergonomic builder so callers don't hand-roll `BTreeMap::insert` chains.
#[derive(Debug, Default)]
pub struct CanonicalMapBuilder(BTreeMap<String, CanonicalValue>);

impl CanonicalMapBuilder {
    pub fn field(mut self, key: impl Into<String>, value: CanonicalValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn field_opt(self, key: impl Into<String>, value: Option<CanonicalValue>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn build(self) -> CanonicalValue {
        CanonicalValue::Map(self.0)
    }
}

impl TryFrom<serde_json::Value> for CanonicalValue {
    type Error = EncodingError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as J;
        Ok(match value {
            J::Null => CanonicalValue::Null,
            J::Bool(b) => CanonicalValue::Bool(b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CanonicalValue::Int(i)
                } else if n.is_u64() {
                    return Err(EncodingError::OutOfRange(n.to_string()));
                } else {
                    return Err(EncodingError::NonIntegerNumber(n.to_string()));
                }
            }
            J::String(s) => CanonicalValue::Str(s),
            J::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(CanonicalValue::try_from(item)?);
                }
                CanonicalValue::Seq(out)
            }
            J::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k, CanonicalValue::try_from(v)?);
                }
                CanonicalValue::Map(out)
            }
        })
    }
}

impl From<CanonicalValue> for serde_json::Value {
    fn from(value: CanonicalValue) -> Self {
        use serde_json::Value as J;
        match value {
            CanonicalValue::Null => J::Null,
            CanonicalValue::Bool(b) => J::Bool(b),
            CanonicalValue::Int(i) => J::Number(i.into()),
            CanonicalValue::Str(s) => J::String(s),
            CanonicalValue::Seq(items) => J::Array(items.into_iter().map(Into::into).collect()),
            CanonicalValue::Map(map) => {
                J::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Encode a value to its canonical byte stream.
pub fn canonicalize(value: &CanonicalValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

/// Convenience: canonicalize straight from a `serde_json::Value`.
pub fn canonicalize_json(value: serde_json::Value) -> Result<Vec<u8>, EncodingError> {
    let canonical = CanonicalValue::try_from(value)?;
    Ok(canonicalize(&canonical))
}

fn write_value(value: &CanonicalValue, out: &mut Vec<u8>) {
    match value {
        CanonicalValue::Null => out.extend_from_slice(b"null"),
        CanonicalValue::Bool(true) => out.extend_from_slice(b"true"),
        CanonicalValue::Bool(false) => out.extend_from_slice(b"false"),
        CanonicalValue::Int(i) => out.extend_from_slice(i.to_string().as_bytes()),
        CanonicalValue::Str(s) => write_string(s, out),
        CanonicalValue::Seq(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        CanonicalValue::Map(map) => {
            // BTreeMap<String, _> already iterates in ascending byte order of
            // its keys (Rust's `Ord` for `String` compares UTF-8 bytes
            // lexicographically, which is equivalent to UTF-16 code-unit
            // order for this alphabet). We still sort explicitly so the
            // contract never silently rides on that coincidence.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key], out);
            }
            out.push(b'}');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_floats() {
        let err = canonicalize_json(serde_json::json!({"a": 1.5})).unwrap_err();
        assert!(matches!(err, EncodingError::NonIntegerNumber(_)));
    }

    #[test]
    fn rejects_u64_out_of_i64_range() {
        let err = canonicalize_json(serde_json::json!({"a": u64::MAX})).unwrap_err();
        assert!(matches!(err, EncodingError::OutOfRange(_)));
    }

    #[test]
    fn sorts_keys_lexicographically() {
        let value = CanonicalValue::map()
            .field("b", CanonicalValue::Int(2))
            .field("a", CanonicalValue::Int(1))
            .build();
        assert_eq!(canonicalize(&value), br#"{"a":1,"b":2}"#);
    }

    #[test]
    fn emits_no_whitespace() {
        let value = CanonicalValue::seq([CanonicalValue::Int(1), CanonicalValue::Int(2)]);
        assert_eq!(canonicalize(&value), b"[1,2]");
    }

    #[test]
    fn escapes_control_chars_and_named_escapes() {
        let value = CanonicalValue::str("a\"b\\c\nd\te\u{0001}");
        let bytes = canonicalize(&value);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "\"a\\\"b\\\\c\\nd\\te\\u0001\""
        );
    }

    #[test]
    fn permuted_key_order_is_identical() {
        let a = CanonicalValue::map()
            .field("x", CanonicalValue::Int(1))
            .field("y", CanonicalValue::Int(2))
            .build();
        let b = CanonicalValue::map()
            .field("y", CanonicalValue::Int(2))
            .field("x", CanonicalValue::Int(1))
            .build();
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn empty_containers_round_trip_shape() {
        assert_eq!(canonicalize(&CanonicalValue::Seq(vec![])), b"[]");
        assert_eq!(canonicalize(&CanonicalValue::Map(BTreeMap::new())), b"{}");
    }

    #[test]
    fn converts_back_to_serde_json_value() {
        let value = CanonicalValue::map()
            .field("a", CanonicalValue::Int(1))
            .field("b", CanonicalValue::seq([CanonicalValue::str("x")]))
            .build();
        let json: serde_json::Value = value.into();
        assert_eq!(json, serde_json::json!({"a": 1, "b": ["x"]}));
    }

    proptest::proptest! {
        #[test]
        fn determinism_holds_for_arbitrary_int_maps(
            entries in proptest::collection::vec((
                "[a-z]{1,6}",
                proptest::num::i64::ANY,
            ), 0..12)
        ) {
            let mut map_a = BTreeMap::new();
            for (k, v) in entries.iter() {
                map_a.insert(k.clone(), CanonicalValue::Int(*v));
            }
            let value_a = CanonicalValue::Map(map_a.clone());
            let value_b = CanonicalValue::Map(map_a);
            proptest::prop_assert_eq!(canonicalize(&value_a), canonicalize(&value_b));
        }
    }
}
