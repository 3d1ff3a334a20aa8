//! Organ-name dictionary used to canonicalise segmentation labels.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Lowercases a label and collapses every run of non-alphanumeric
/// characters into a single underscore: `" Left-Kidney (L) "` becomes
/// `"left_kidney_l"`.
pub fn normalize_label(label: &str) -> String {
    let mut normalized = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_alphanumeric() {
            normalized.extend(c.to_lowercase());
        } else if !normalized.is_empty() && !normalized.ends_with('_') {
            normalized.push('_');
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }
    normalized
}

/// `{ normalized_label: organ_name }`, read-only during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganDictionary {
    entries: HashMap<String, String>,
}

impl OrganDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys are normalised on the way in, so callers may use raw labels.
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (normalize_label(k.as_ref()), v.into()))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let raw: HashMap<String, String> = serde_json::from_str(&content)?;
        Ok(Self::from_map(raw))
    }

    pub fn lookup(&self, label: &str) -> Option<&str> {
        self.entries.get(&normalize_label(label)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
