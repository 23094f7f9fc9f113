use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

/// Immutable snapshot of the active column filters.
///
/// Cloning is cheap; every edit produces a new snapshot, so a published value can never be
/// changed underneath a subscriber. Empty values are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct FilterState {
    entries: Arc<BTreeMap<String, String>>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot with `column` set to `value`, or removed when the value is empty.
    pub fn with(&self, column: &str, value: Option<&str>) -> Self {
        let mut entries = (*self.entries).clone();
        match value.filter(|value| !value.is_empty()) {
            Some(value) => {
                entries.insert(column.to_string(), value.to_string());
            }
            None => {
                entries.remove(column);
            }
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.entries.get(column).map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.entries.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(column, value)| (column.as_str(), value.as_str()))
    }

    pub fn to_wire(&self) -> BTreeMap<String, String> {
        (*self.entries).clone()
    }
}

impl From<BTreeMap<String, String>> for FilterState {
    fn from(mut entries: BTreeMap<String, String>) -> Self {
        entries.retain(|_, value| !value.is_empty());
        Self {
            entries: Arc::new(entries),
        }
    }
}

impl From<FilterState> for BTreeMap<String, String> {
    fn from(value: FilterState) -> Self {
        value.to_wire()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FilterState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(column, value)| (column.into(), value.into()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }
}
