use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One payload value travelling between actors. Produced by a single output
/// step, consumed by a single input step, then discarded.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize)]
pub struct Token {
    id: String,
    payload: Value,
    provenance: Option<String>,
}

impl Token {
    pub fn new(payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            provenance: None,
        }
    }

    pub fn with_provenance(payload: Value, producer: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            provenance: Some(producer.to_string()),
        }
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn payload(&self) -> Value {
        self.payload.clone()
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Full name of the actor that produced this token, if recorded.
    pub fn provenance(&self) -> Option<&str> {
        self.provenance.as_deref()
    }

    pub fn set_provenance(&mut self, producer: &str) {
        self.provenance = Some(producer.to_string());
    }

    /// Stable hash of the payload, used in log lines.
    pub fn payload_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.payload.to_string().hash(&mut hasher);
        hasher.finish()
    }
}
