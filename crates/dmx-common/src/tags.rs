//! Ordered metadata tag maps.
//!
//! Containers expose metadata as ordered key/value pairs with case-insensitive
//! keys ("Title" and "TITLE" are the same tag). A plain vector keeps the
//! original order for display while staying cheap for the handful of entries
//! real files carry.

use serde::{Deserialize, Serialize};

/// An ordered, case-insensitive string tag map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMap {
    entries: Vec<(String, String)>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing an existing entry with the same
    /// (case-insensitive) key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            e.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a tag by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Copy all entries of `other` into `self`, replacing duplicate keys.
    pub fn merge(&mut self, other: &TagMap) {
        for (k, v) in &other.entries {
            self.set(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
