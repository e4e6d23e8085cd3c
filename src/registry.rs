use std::fmt;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actor::ActorError;
use crate::flow::FlowDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Idle,
    Running,
    Finished,
    Stopped,
    Failed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Idle => write!(f, "idle"),
            FlowState::Running => write!(f, "running"),
            FlowState::Finished => write!(f, "finished"),
            FlowState::Stopped => write!(f, "stopped"),
            FlowState::Failed => write!(f, "failed"),
        }
    }
}

struct FlowEntry {
    definition: Value,
    state: FlowState,
    stop: CancellationToken,
}

/// Flow definitions and run states known to one scripting engine.
#[derive(Default)]
pub struct FlowRegistry {
    flows: DashMap<String, FlowEntry>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition; returns the stop token tied to the entry so a
    /// runner can link its flow to remote stop requests.
    pub fn register(&self, def: &FlowDef) -> Result<CancellationToken, ActorError> {
        let definition = serde_json::to_value(def)
            .map_err(|e| ActorError::Internal(format!("cannot serialize flow definition: {}", e)))?;
        let stop = CancellationToken::new();
        self.flows.insert(
            def.id.clone(),
            FlowEntry {
                definition,
                state: FlowState::Idle,
                stop: stop.clone(),
            },
        );
        Ok(stop)
    }

    /// Loads every *.yaml / *.yml / *.json flow file of a directory.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, ActorError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ActorError::NotFound(format!("flows directory '{}': {}", dir.display(), e))
        })?;
        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
                continue;
            }
            match FlowDef::load(&path) {
                Ok(def) => {
                    info!("registered flow '{}' from {}", def.id, path.display());
                    self.register(&def)?;
                    count += 1;
                }
                Err(e) => warn!("skipping '{}': {}", path.display(), e),
            }
        }
        Ok(count)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn definition(&self, id: &str) -> Option<Value> {
        self.flows.get(id).map(|e| e.definition.clone())
    }

    pub fn state(&self, id: &str) -> Option<FlowState> {
        self.flows.get(id).map(|e| e.state)
    }

    pub fn set_state(&self, id: &str, state: FlowState) {
        if let Some(mut entry) = self.flows.get_mut(id) {
            entry.state = state;
        }
    }

    /// Cancels the entry's stop token. Returns false for unknown flows.
    pub fn stop_flow(&self, id: &str) -> bool {
        match self.flows.get_mut(id) {
            Some(mut entry) => {
                entry.stop.cancel();
                entry.state = FlowState::Stopped;
                true
            }
            None => false,
        }
    }

    pub fn stop_token(&self, id: &str) -> Option<CancellationToken> {
        self.flows.get(id).map(|e| e.stop.clone())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::AnyActor;
    use crate::actors::StringConstants;
    use crate::control::Sequence;
    use std::collections::HashMap;

    fn def(id: &str) -> FlowDef {
        FlowDef {
            id: id.to_string(),
            title: String::new(),
            description: String::new(),
            variables: HashMap::new(),
            root: AnyActor(Box::new(Sequence::with_children(
                "Flow",
                vec![AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["x".into()],
                )))],
            ))),
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = FlowRegistry::new();
        registry.register(&def("b")).unwrap();
        registry.register(&def("a")).unwrap();
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.state("a"), Some(FlowState::Idle));
        assert!(registry.definition("a").is_some());
        assert!(registry.definition("zzz").is_none());
    }

    #[test]
    fn test_stop_flow_cancels_token() {
        let registry = FlowRegistry::new();
        let token = registry.register(&def("a")).unwrap();
        assert!(!token.is_cancelled());
        assert!(registry.stop_flow("a"));
        assert!(token.is_cancelled());
        assert_eq!(registry.state("a"), Some(FlowState::Stopped));
        assert!(!registry.stop_flow("unknown"));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = serde_yaml_bw::to_string(&def("from_file")).unwrap();
        std::fs::write(dir.path().join("one.yaml"), yaml).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "nope").unwrap();

        let registry = FlowRegistry::new();
        let count = registry.load_dir(dir.path()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(registry.ids(), vec!["from_file".to_string()]);
    }
}
