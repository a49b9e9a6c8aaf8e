//! Composite identity keys.
//!
//! An identity key is the ordered list of named non-time fields that
//! separates independent series of one kind (user, worker, algorithm...).
//! Equality, hashing and ordering cover every field.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Value of one identity field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Small integer codes (device index, stat code).
    Int(i64),
    /// Free text (user address, worker name, algorithm).
    Str(String),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

/// Ordered set of named identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    fields: Vec<(String, FieldValue)>,
}

impl IdentityKey {
    /// Build a key from `(name, value)` pairs, keeping their order.
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of field `name`.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Field names in key order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// `(name, value)` pairs in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the key has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl Serialize for IdentityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(user: &str, worker: &str) -> IdentityKey {
        IdentityKey::new([("user", user), ("worker", worker)])
    }

    #[test]
    fn equality_covers_every_field() {
        assert_eq!(key("a", "w1"), key("a", "w1"));
        assert_ne!(key("a", "w1"), key("a", "w2"));
        let set: HashSet<_> = [key("a", "w1"), key("a", "w1"), key("b", "w1")].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn lookup_and_display() {
        let k = IdentityKey::new([
            ("user", FieldValue::from("alice")),
            ("device", FieldValue::from(3_i64)),
        ]);
        assert_eq!(k.get("device"), Some(&FieldValue::Int(3)));
        assert_eq!(k.get("worker"), None);
        assert_eq!(k.to_string(), "user=alice,device=3");
        assert_eq!(k.names().collect::<Vec<_>>(), vec!["user", "device"]);
    }

    #[test]
    fn serializes_as_map() {
        let k = IdentityKey::new([("user", FieldValue::from("alice")), ("device", FieldValue::from(0_i64))]);
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, r#"{"user":"alice","device":0}"#);
        let v: FieldValue = serde_json::from_str("7").unwrap();
        assert_eq!(v, FieldValue::Int(7));
    }
}
