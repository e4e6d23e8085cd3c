use std::collections::HashMap;
use std::sync::Mutex;
use serde_json::Value;

/// Key/value state shared by every actor of one flow run. Entries live until
/// the run ends; parallel branches go through the same lock.
#[derive(Debug, Default)]
pub struct Storage {
    values: Mutex<HashMap<String, Value>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid names: letters, digits, '_', '-' and '.'.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.lock().unwrap().get(name).cloned()
    }

    /// Stores a value, returning the previous one if present.
    pub fn put(&self, name: &str, value: Value) -> Option<Value> {
        self.values.lock().unwrap().insert(name.to_string(), value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.lock().unwrap().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.lock().unwrap().remove(name)
    }

    pub fn clear(&self) {
        self.values.lock().unwrap().clear();
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().unwrap().is_empty()
    }
}
