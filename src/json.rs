//! # JSON Values & Visitors
//!
//! This module provides the canonical representation for all JSON document
//! content of unknown shape. A [`JsonValue`] wraps exactly one of the six
//! JSON variants: object, array, string, number, boolean, or null. Every
//! number is an IEEE-754 double, matching what arrives off the wire.
//!
//! The representation is deliberately opaque. Callers reach the contents in
//! three ways only:
//!
//! - traverse with a [`Visitor`] via [`JsonValue::accept`],
//! - compare structurally with `==`,
//! - serialize/deserialize through serde.
//!
//! Visitor methods receive shared borrows of the composite shapes, so a
//! visitor can never mutate a value in place; producing a changed tree means
//! building a new [`JsonValue`]. The patch engine relies on this to keep a
//! document unchanged until its replacement is committed.
//!
//! ## Equality
//!
//! Equality is structural deep equality. Object member order is irrelevant
//! (members are kept sorted), array order is significant, and numbers compare
//! as doubles, so `1` and `1.0` are equal.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, SeqAccess};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

// =============================================================================
// JsonValue
// =============================================================================

/// An arbitrary JSON value in canonical form.
///
/// Construct one by deserializing wire bytes with [`JsonValue::from_slice`],
/// by converting a [`serde_json::Value`] with `From`, or from the typed
/// `From` impls for composites and primitives. The zero-information value is
/// [`JsonValue::null`].
#[derive(Clone, Debug, PartialEq)]
pub struct JsonValue {
    data: JsonData,
}

/// Closed set of variants a [`JsonValue`] can hold. Private: the only ways in
/// are the constructors, the only ways out are visitors.
#[derive(Clone, Debug, PartialEq)]
enum JsonData {
    Object(BTreeMap<String, JsonValue>),
    Array(Vec<JsonValue>),
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

/// A type-dispatched traversal over a [`JsonValue`].
///
/// [`JsonValue::accept`] calls exactly one method, chosen by the wrapped
/// variant. The object and array methods may recursively call `accept` on
/// their elements.
pub trait Visitor {
    /// The value produced by a successful visit.
    type Output;

    /// Called for an object; receives the members keyed by name.
    fn object(&mut self, members: &BTreeMap<String, JsonValue>) -> Result<Self::Output>;

    /// Called for an array; receives the elements in order.
    fn array(&mut self, items: &[JsonValue]) -> Result<Self::Output>;

    /// Called for a string.
    fn string(&mut self, value: &str) -> Result<Self::Output>;

    /// Called for a number. All JSON numbers are IEEE-754 doubles.
    fn number(&mut self, value: f64) -> Result<Self::Output>;

    /// Called for a boolean.
    fn boolean(&mut self, value: bool) -> Result<Self::Output>;

    /// Called for null.
    fn null(&mut self) -> Result<Self::Output>;
}

impl JsonValue {
    /// The JSON `null` value.
    pub fn null() -> Self {
        JsonValue {
            data: JsonData::Null,
        }
    }

    /// Parses raw JSON bytes into a canonical value.
    ///
    /// Fails with [`Error::Json`](crate::error::Error::Json) when the bytes
    /// are not valid JSON.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes this value to JSON text.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Converts to a [`serde_json::Value`], e.g. for the schema validator.
    pub fn to_serde(&self) -> serde_json::Value {
        match &self.data {
            JsonData::Object(members) => serde_json::Value::Object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_serde()))
                    .collect(),
            ),
            JsonData::Array(items) => {
                serde_json::Value::Array(items.iter().map(JsonValue::to_serde).collect())
            }
            JsonData::String(s) => serde_json::Value::String(s.clone()),
            JsonData::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            JsonData::Bool(b) => serde_json::Value::Bool(*b),
            JsonData::Null => serde_json::Value::Null,
        }
    }

    /// Applies the given visitor to this value, dispatching on the wrapped
    /// variant. Returns whatever the visitor method returns.
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<V::Output> {
        match &self.data {
            JsonData::Object(members) => visitor.object(members),
            JsonData::Array(items) => visitor.array(items),
            JsonData::String(s) => visitor.string(s),
            JsonData::Number(n) => visitor.number(*n),
            JsonData::Bool(b) => visitor.boolean(*b),
            JsonData::Null => visitor.null(),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<serde_json::Value> for JsonValue {
    /// Canonicalizes an arbitrary `serde_json::Value`. Total: every
    /// `serde_json` value maps to one of the six variants, with integers
    /// widened to doubles.
    fn from(value: serde_json::Value) -> Self {
        let data = match value {
            serde_json::Value::Object(members) => JsonData::Object(
                members
                    .into_iter()
                    .map(|(k, v)| (k, JsonValue::from(v)))
                    .collect(),
            ),
            serde_json::Value::Array(items) => {
                JsonData::Array(items.into_iter().map(JsonValue::from).collect())
            }
            serde_json::Value::String(s) => JsonData::String(s),
            serde_json::Value::Number(n) => JsonData::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::Bool(b) => JsonData::Bool(b),
            serde_json::Value::Null => JsonData::Null,
        };
        JsonValue { data }
    }
}

impl From<BTreeMap<String, JsonValue>> for JsonValue {
    fn from(members: BTreeMap<String, JsonValue>) -> Self {
        JsonValue {
            data: JsonData::Object(members),
        }
    }
}

impl From<Vec<JsonValue>> for JsonValue {
    fn from(items: Vec<JsonValue>) -> Self {
        JsonValue {
            data: JsonData::Array(items),
        }
    }
}

impl From<String> for JsonValue {
    fn from(value: String) -> Self {
        JsonValue {
            data: JsonData::String(value),
        }
    }
}

impl From<&str> for JsonValue {
    fn from(value: &str) -> Self {
        JsonValue {
            data: JsonData::String(value.to_string()),
        }
    }
}

impl From<f64> for JsonValue {
    fn from(value: f64) -> Self {
        JsonValue {
            data: JsonData::Number(value),
        }
    }
}

impl From<bool> for JsonValue {
    fn from(value: bool) -> Self {
        JsonValue {
            data: JsonData::Bool(value),
        }
    }
}

// =============================================================================
// Serde
// =============================================================================

impl Serialize for JsonValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.data {
            JsonData::Object(members) => serializer.collect_map(members.iter()),
            JsonData::Array(items) => serializer.collect_seq(items.iter()),
            JsonData::String(s) => serializer.serialize_str(s),
            JsonData::Number(n) => serializer.serialize_f64(*n),
            JsonData::Bool(b) => serializer.serialize_bool(*b),
            JsonData::Null => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = JsonValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any valid JSON value")
            }

            fn visit_bool<E: serde::de::Error>(
                self,
                v: bool,
            ) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::from(v))
            }

            fn visit_i64<E: serde::de::Error>(
                self,
                v: i64,
            ) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::from(v as f64))
            }

            fn visit_u64<E: serde::de::Error>(
                self,
                v: u64,
            ) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::from(v as f64))
            }

            fn visit_f64<E: serde::de::Error>(
                self,
                v: f64,
            ) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::from(v))
            }

            fn visit_str<E: serde::de::Error>(
                self,
                v: &str,
            ) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::from(v))
            }

            fn visit_none<E: serde::de::Error>(self) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::null())
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<JsonValue, E> {
                Ok(JsonValue::null())
            }

            fn visit_some<D2: Deserializer<'de>>(
                self,
                deserializer: D2,
            ) -> std::result::Result<JsonValue, D2::Error> {
                JsonValue::deserialize(deserializer)
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<JsonValue, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<JsonValue>()? {
                    items.push(item);
                }
                Ok(JsonValue::from(items))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<JsonValue, A::Error> {
                let mut members = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, JsonValue>()? {
                    members.insert(key, value);
                }
                Ok(JsonValue::from(members))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

// =============================================================================
// Tests
// =============================================================================
