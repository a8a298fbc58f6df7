//! Canonical JSON.
//!
//! Canonical JSON is the serialization boundary for hashing and signing: any
//! two semantically equal values must produce identical bytes. Objects are
//! backed by `BTreeMap` so keys are sorted by construction, numbers must be
//! integers within ±(2^53 − 1), and serialization goes through
//! `serde_json`'s compact writer which emits exactly the required minimal
//! escapes and no insignificant whitespace.

use std::collections::BTreeMap;
use std::fmt;

use as_variant::as_variant;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// The largest magnitude a canonical JSON integer may have.
pub const MAX_CANONICAL_INT: i64 = (1 << 53) - 1;

#[derive(Error, Debug)]
pub enum CanonicalJsonError {
    /// The number is a float or lies outside ±(2^53 − 1).
    #[error("number is not a valid canonical JSON integer")]
    IntConvert,

    #[error("serde error: {0}")]
    SerDe(#[from] serde_json::Error),

    /// A canonical object was required but the value is not a JSON object.
    #[error("value is not a JSON object")]
    NotAnObject,
}

/// The inner type of [`CanonicalJsonValue::Object`].
pub type CanonicalJsonObject = BTreeMap<String, CanonicalJsonValue>;

/// A JSON value restricted to the canonical subset.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum CanonicalJsonValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    String(String),
    Array(Vec<CanonicalJsonValue>),
    Object(CanonicalJsonObject),
}

impl CanonicalJsonValue {
    pub fn as_bool(&self) -> Option<bool> {
        as_variant!(self, Self::Bool).copied()
    }

    pub fn as_integer(&self) -> Option<i64> {
        as_variant!(self, Self::Integer).copied()
    }

    pub fn as_str(&self) -> Option<&str> {
        as_variant!(self, Self::String).map(String::as_str)
    }

    pub fn as_array(&self) -> Option<&[CanonicalJsonValue]> {
        as_variant!(self, Self::Array).map(Vec::as_slice)
    }

    pub fn as_object(&self) -> Option<&CanonicalJsonObject> {
        as_variant!(self, Self::Object)
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<CanonicalJsonValue>> {
        as_variant!(self, Self::Array)
    }

    pub fn as_object_mut(&mut self) -> Option<&mut CanonicalJsonObject> {
        as_variant!(self, Self::Object)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }
}

impl fmt::Debug for CanonicalJsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            Self::String(v) => f.debug_tuple("String").field(v).finish(),
            Self::Array(v) => {
                f.write_str("Array(")?;
                fmt::Debug::fmt(v, f)?;
                f.write_str(")")
            }
            Self::Object(v) => {
                f.write_str("Object(")?;
                fmt::Debug::fmt(v, f)?;
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for CanonicalJsonValue {
    /// The canonical form. Intentionally unaffected by any formatting
    /// parameters: pretty-printing would not be canonical anymore.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string(self).map_err(|_| fmt::Error)?)
    }
}

impl TryFrom<JsonValue> for CanonicalJsonValue {
    type Error = CanonicalJsonError;

    fn try_from(val: JsonValue) -> Result<Self, Self::Error> {
        Ok(match val {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(num) => {
                let int = num.as_i64().ok_or(CanonicalJsonError::IntConvert)?;
                if !(-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&int) {
                    return Err(CanonicalJsonError::IntConvert);
                }
                Self::Integer(int)
            }
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(vec) => Self::Array(
                vec.into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(obj) => Self::Object(
                obj.into_iter()
                    .map(|(k, v)| Ok((k, v.try_into()?)))
                    .collect::<Result<_, CanonicalJsonError>>()?,
            ),
        })
    }
}

impl From<CanonicalJsonValue> for JsonValue {
    fn from(val: CanonicalJsonValue) -> Self {
        match val {
            CanonicalJsonValue::Null => Self::Null,
            CanonicalJsonValue::Bool(b) => Self::Bool(b),
            CanonicalJsonValue::Integer(int) => Self::Number(int.into()),
            CanonicalJsonValue::String(s) => Self::String(s),
            CanonicalJsonValue::Array(vec) => Self::Array(vec.into_iter().map(Into::into).collect()),
            CanonicalJsonValue::Object(obj) => Self::Object(
                obj.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for CanonicalJsonValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CanonicalJsonValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for CanonicalJsonValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for CanonicalJsonValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl Serialize for CanonicalJsonValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(v) => v.serialize(serializer),
            Self::Object(m) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalJsonValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = JsonValue::deserialize(deserializer)?;
        val.try_into().map_err(serde::de::Error::custom)
    }
}

/// Fallible conversion from a `serde_json::Map` to a canonical object.
pub fn try_from_json_map(
    json: serde_json::Map<String, JsonValue>,
) -> Result<CanonicalJsonObject, CanonicalJsonError> {
    json.into_iter().map(|(k, v)| Ok((k, v.try_into()?))).collect()
}

/// Converts any serializable value to a canonical value.
pub fn to_canonical_value<T: Serialize>(
    value: T,
) -> Result<CanonicalJsonValue, CanonicalJsonError> {
    serde_json::to_value(value)?.try_into()
}

/// Converts any serializable value to a canonical object, failing if it does
/// not serialize to a JSON object.
pub fn to_canonical_object<T: Serialize>(
    value: T,
) -> Result<CanonicalJsonObject, CanonicalJsonError> {
    match to_canonical_value(value)? {
        CanonicalJsonValue::Object(obj) => Ok(obj),
        _ => Err(CanonicalJsonError::NotAnObject),
    }
}

/// Deserializes a typed value back out of a canonical object.
pub fn from_canonical_object<T: DeserializeOwned>(
    object: CanonicalJsonObject,
) -> Result<T, CanonicalJsonError> {
    Ok(serde_json::from_value(
        CanonicalJsonValue::Object(object).into(),
    )?)
}

/// The canonical string form of an object.
pub fn to_canonical_string(object: &CanonicalJsonObject) -> String {
    serde_json::to_string(object).expect("canonical objects always serialize")
}

/// The canonical byte form of an object, the input to hashing and signing.
pub fn canonical_json_bytes(object: &CanonicalJsonObject) -> Vec<u8> {
    serde_json::to_vec(object).expect("canonical objects always serialize")
}

#[cfg(test)]
mod tests {
    use serde_json::{from_str as from_json_str, json};

    use super::*;

    fn canonical(input: &str) -> String {
        let value: CanonicalJsonValue = from_json_str(input).unwrap();
        value.to_string()
    }

    #[test]
    fn canonical_json_examples() {
        assert_eq!(canonical("{}"), "{}");

        assert_eq!(
            canonical(
                r#"{
                    "one": 1,
                    "two": "Two"
                }"#
            ),
            r#"{"one":1,"two":"Two"}"#
        );

        assert_eq!(
            canonical(
                r#"{
                    "b": "2",
                    "a": "1"
                }"#
            ),
            r#"{"a":"1","b":"2"}"#
        );

        assert_eq!(
            canonical(
                r#"{
                    "auth": {
                        "success": true,
                        "mxid": "@john.doe:example.com",
                        "profile": {
                            "display_name": "John Doe",
                            "three_pids": [
                                {
                                    "medium": "email",
                                    "address": "john.doe@example.org"
                                },
                                {
                                    "medium": "msisdn",
                                    "address": "123456789"
                                }
                            ]
                        }
                    }
                }"#
            ),
            r#"{"auth":{"mxid":"@john.doe:example.com","profile":{"display_name":"John Doe","three_pids":[{"address":"john.doe@example.org","medium":"email"},{"address":"123456789","medium":"msisdn"}]},"success":true}}"#
        );

        assert_eq!(canonical(r#"{"a": "日本語"}"#), r#"{"a":"日本語"}"#);
        assert_eq!(canonical(r#"{"本": 2, "日": 1}"#), r#"{"日":1,"本":2}"#);
        assert_eq!(canonical(r#"{"a": "日"}"#), r#"{"a":"日"}"#);
        assert_eq!(canonical(r#"{"a": null}"#), r#"{"a":null}"#);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let value: CanonicalJsonValue =
            from_json_str(r#"{"z": [3, 2], "a": {"nested": true}, "m": "text"}"#).unwrap();
        let once = value.to_string();
        let twice = from_json_str::<CanonicalJsonValue>(&once).unwrap().to_string();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_floats() {
        assert!(CanonicalJsonValue::try_from(json!(1.5)).is_err());
        assert!(CanonicalJsonValue::try_from(json!({"a": 0.1})).is_err());
    }

    #[test]
    fn rejects_out_of_range_integers() {
        assert!(CanonicalJsonValue::try_from(json!(MAX_CANONICAL_INT)).is_ok());
        assert!(CanonicalJsonValue::try_from(json!(MAX_CANONICAL_INT + 1)).is_err());
        assert!(CanonicalJsonValue::try_from(json!(-MAX_CANONICAL_INT - 1)).is_err());
        assert!(CanonicalJsonValue::try_from(json!(u64::MAX)).is_err());
    }

    #[test]
    fn object_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Thing {
            foo: String,
            bar: Vec<u8>,
        }

        let thing = Thing { foo: "string".into(), bar: vec![0, 1, 2] };
        let object = to_canonical_object(&thing).unwrap();
        assert_eq!(to_canonical_string(&object), r#"{"bar":[0,1,2],"foo":"string"}"#);
        let back: Thing = from_canonical_object(object).unwrap();
        assert_eq!(back, thing);
    }
}
