//! Copy-on-write message metadata.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Key-value metadata attached to a message.
///
/// Metadata is immutable: every mutating operation returns a new instance
/// and leaves existing references untouched. Instances that were never
/// modified share the same backing map.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    entries: Arc<HashMap<String, serde_json::Value>>,
}

impl MetaData {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metadata from an existing map.
    pub fn from_map(map: HashMap<String, serde_json::Value>) -> Self {
        Self {
            entries: Arc::new(map),
        }
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Returns whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with_entry(&self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut map = (*self.entries).clone();
        map.insert(key.into(), value);
        Self {
            entries: Arc::new(map),
        }
    }

    /// Returns a copy with all entries of `other` merged in.
    ///
    /// Entries of `other` win on key collisions.
    pub fn merged_with(&self, other: &MetaData) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut map = (*self.entries).clone();
        for (key, value) in other.entries.iter() {
            map.insert(key.clone(), value.clone());
        }
        Self {
            entries: Arc::new(map),
        }
    }

    /// Returns a copy without `key`.
    pub fn without(&self, key: &str) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let mut map = (*self.entries).clone();
        map.remove(key);
        Self {
            entries: Arc::new(map),
        }
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }
}

impl PartialEq for MetaData {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for MetaData {}

impl Serialize for MetaData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MetaData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::deserialize(deserializer).map(Self::from_map)
    }
}

impl FromIterator<(String, serde_json::Value)> for MetaData {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_entry_does_not_touch_the_original() {
        let original = MetaData::new();
        let updated = original.with_entry("trace", serde_json::json!("abc"));

        assert!(original.is_empty());
        assert_eq!(updated.get("trace"), Some(&serde_json::json!("abc")));
    }

    #[test]
    fn merged_with_prefers_other_on_collision() {
        let base = MetaData::new().with_entry("key", serde_json::json!(1));
        let other = MetaData::new().with_entry("key", serde_json::json!(2));

        let merged = base.merged_with(&other);
        assert_eq!(merged.get("key"), Some(&serde_json::json!(2)));
        assert_eq!(base.get("key"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn without_removes_only_the_named_key() {
        let metadata = MetaData::new()
            .with_entry("a", serde_json::json!(1))
            .with_entry("b", serde_json::json!(2));

        let trimmed = metadata.without("a");
        assert!(!trimmed.contains_key("a"));
        assert!(trimmed.contains_key("b"));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn serialization_roundtrip() {
        let metadata = MetaData::new().with_entry("correlation_id", serde_json::json!("123"));
        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: MetaData = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata, deserialized);
    }
}
