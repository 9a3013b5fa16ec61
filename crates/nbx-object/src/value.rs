//! Opaque angular values
//!
//! Values cross the boundary to renderers as JSON, so anything bound must be
//! representable as a [`serde_json::Value`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serializable value held by a bound object
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AngularValue(serde_json::Value);

impl AngularValue {
    /// Encode any serializable value
    ///
    /// # Errors
    /// Returns the serializer error if `value` has no JSON representation
    /// (for example a map with non-string keys).
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self)
    }

    /// Decode into a typed value
    ///
    /// # Errors
    /// Returns the deserializer error if the JSON does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    /// Size of the JSON encoding in bytes
    ///
    /// # Errors
    /// Returns the serializer error if the value cannot be written.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(&self.0).map(|bytes| bytes.len())
    }

    /// Borrow the underlying JSON
    #[inline]
    #[must_use]
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Unwrap into the underlying JSON
    #[inline]
    #[must_use]
    pub fn into_json(self) -> serde_json::Value {
        self.0
    }

    /// Text used when the value is interpolated into a template
    ///
    /// Strings render without quotes and `null` renders empty.
    #[must_use]
    pub fn render(&self) -> String {
        match &self.0 {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Value> for AngularValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<i32> for AngularValue {
    fn from(value: i32) -> Self {
        Self(value.into())
    }
}

impl From<i64> for AngularValue {
    fn from(value: i64) -> Self {
        Self(value.into())
    }
}

impl From<f64> for AngularValue {
    fn from(value: f64) -> Self {
        Self(value.into())
    }
}

impl From<bool> for AngularValue {
    fn from(value: bool) -> Self {
        Self(value.into())
    }
}

impl From<&str> for AngularValue {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for AngularValue {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for AngularValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn encode_and_decode_struct() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let value = AngularValue::encode(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(value.as_json(), &json!({"x": 1, "y": 2}));
        assert_eq!(value.decode::<Point>().unwrap(), Point { x: 1, y: 2 });
    }

    #[test]
    fn encode_rejects_non_string_map_keys() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");

        assert!(AngularValue::encode(&map).is_err());
    }

    #[test]
    fn render_for_templates() {
        assert_eq!(AngularValue::from(3).render(), "3");
        assert_eq!(AngularValue::from("text").render(), "text");
        assert_eq!(AngularValue::default().render(), "");
        assert_eq!(AngularValue::from(json!([1, 2])).render(), "[1,2]");
    }

    #[test]
    fn encoded_len_matches_json() {
        assert_eq!(AngularValue::from("abc").encoded_len().unwrap(), 5);
        assert_eq!(AngularValue::from(10).encoded_len().unwrap(), 2);
    }
}
