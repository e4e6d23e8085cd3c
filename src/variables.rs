use std::collections::HashMap;
use std::sync::RwLock;
use serde_json::Value;
use tracing::warn;

/// Start delimiter of a variable reference.
pub const START: &str = "${";
/// End delimiter of a variable reference.
pub const END: &str = "}";
/// Namespace prefix resolving against a callable source actor's output.
pub const CALLABLE_PREFIX: &str = "callable:";
/// Namespace prefix resolving against flow storage.
pub const STORAGE_PREFIX: &str = "storage:";
/// Substituted whenever a dynamic reference fails to resolve.
pub const NOT_FOUND: &str = "**not found**";

/// Live values backing the two dynamic namespaces. Looked up fresh on every
/// expansion; results are never cached.
pub trait DynamicLookup {
    /// Output value of the named callable source actor, or a failure reason.
    fn callable_value(&self, name: &str) -> Result<String, String>;

    /// Storage value under the given name, if present.
    fn storage_value(&self, name: &str) -> Option<String>;
}

/// Lookup for contexts without a running flow; every dynamic reference
/// degrades to the not-found sentinel.
pub struct NoDynamics;

impl DynamicLookup for NoDynamics {
    fn callable_value(&self, _name: &str) -> Result<String, String> {
        Err("no flow context".to_string())
    }

    fn storage_value(&self, _name: &str) -> Option<String> {
        None
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flat string variables of one flow run plus the `${...}` expansion rules.
#[derive(Debug, Default)]
pub struct Variables {
    values: RwLock<HashMap<String, String>>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().unwrap().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.read().unwrap().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.values.write().unwrap().remove(name)
    }

    pub fn clear(&self) {
        self.values.write().unwrap().clear();
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wraps a bare name in the variable delimiters.
    pub fn pad(name: &str) -> String {
        if name.starts_with(START) && name.ends_with(END) {
            name.to_string()
        } else {
            format!("{}{}{}", START, name, END)
        }
    }

    pub fn is_reference(s: &str) -> bool {
        s.starts_with(START) && s.ends_with(END)
    }

    /// Expands all variable references in `s`.
    ///
    /// Dynamic references (`${callable:...}`, `${storage:...}`) are resolved
    /// first in one left-to-right pass; resolved values are terminal and not
    /// re-scanned. Plain references are substituted afterwards; unknown plain
    /// names stay verbatim.
    pub fn expand(&self, s: &str, dynamics: &dyn DynamicLookup) -> String {
        let result = self.expand_dynamic(s, dynamics);
        self.expand_plain(&result)
    }

    fn expand_dynamic(&self, s: &str, dynamics: &dyn DynamicLookup) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find(START) {
            let after = &rest[start + START.len()..];
            let Some(end) = after.find(END) else {
                // unterminated reference, keep as-is
                break;
            };
            let name = &after[..end];
            let resolved = if let Some(stripped) = name.strip_prefix(CALLABLE_PREFIX) {
                Some(match dynamics.callable_value(stripped) {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!("callable variable '{}' did not resolve: {}", stripped, reason);
                        NOT_FOUND.to_string()
                    }
                })
            } else if let Some(stripped) = name.strip_prefix(STORAGE_PREFIX) {
                Some(dynamics.storage_value(stripped).unwrap_or_else(|| {
                    warn!("storage variable '{}' did not resolve", stripped);
                    NOT_FOUND.to_string()
                }))
            } else {
                None
            };
            match resolved {
                Some(value) => {
                    result.push_str(&rest[..start]);
                    result.push_str(&value);
                }
                None => {
                    // plain reference, handled by the second pass
                    result.push_str(&rest[..start + START.len() + end + END.len()]);
                }
            }
            rest = &after[end + END.len()..];
        }
        result.push_str(rest);
        result
    }

    fn expand_plain(&self, s: &str) -> String {
        let values = self.values.read().unwrap();
        let mut result = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find(START) {
            let after = &rest[start + START.len()..];
            let Some(end) = after.find(END) else {
                break;
            };
            let name = &after[..end];
            result.push_str(&rest[..start]);
            match values.get(name) {
                Some(value) => result.push_str(value),
                None => result.push_str(&rest[start..start + START.len() + end + END.len()]),
            }
            rest = &after[end + END.len()..];
        }
        result.push_str(rest);
        result
    }
}
