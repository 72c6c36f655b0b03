use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Suite-local store of values produced by earlier steps. Keys are
/// write-once unless the writer declares overwrite intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("context key '{key}' is already set")]
pub struct WriteConflict {
    pub key: String,
}

impl Context {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: Value,
        overwrite: bool,
    ) -> Result<(), WriteConflict> {
        let key = key.into();
        if !overwrite && self.values.contains_key(&key) {
            return Err(WriteConflict { key });
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn missing<'a>(&self, keys: &'a [String]) -> Vec<&'a str> {
        keys.iter()
            .filter(|key| !self.values.contains_key(key.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}
