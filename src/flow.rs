use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actor::{Actor, ActorError, ActorKind, AnyActor, HandlerPolicy};
use crate::callable;
use crate::execution::listener::{ExecutionEvent, ExecutionListener, ExecutionPhase};
use crate::storage::Storage;
use crate::token::Token;
use crate::variables::{self, DynamicLookup, Variables};

/// Declarative form of a flow: identifiers, initial variables and the root
/// actor tree. This is what flow files contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDef {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub root: AnyActor,
}

impl FlowDef {
    pub fn from_yaml(text: &str) -> Result<Self, ActorError> {
        serde_yaml_bw::from_str(text)
            .map_err(|e| ActorError::Setup(format!("cannot parse flow definition: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<Self, ActorError> {
        serde_json::from_str(text)
            .map_err(|e| ActorError::Setup(format!("cannot parse flow definition: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, ActorError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ActorError::NotFound(format!("flow file '{}': {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Self::from_json(&text),
        }
    }
}

/// One record per actor invocation, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRecord {
    pub actor: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub result: Result<(), ActorError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub records: Vec<ActorRecord>,
    /// If the run stopped early, the failing actor and its error.
    pub error: Option<(String, ActorError)>,
    /// Total elapsed wall time in milliseconds.
    pub total_ms: i64,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) struct ActorSlot {
    pub(crate) actor: Option<Box<dyn Actor>>,
    pub(crate) set_up: bool,
}

/// One node of the flow-run arena. Structure (parent, ordered children) is
/// fixed after build; the actor instance sits behind its own lock so parallel
/// branches can drive disjoint subtrees concurrently.
pub(crate) struct ActorNode {
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) kind: ActorKind,
    pub(crate) skip: bool,
    pub(crate) external: bool,
    pub(crate) policy: Option<HandlerPolicy>,
    pub(crate) parent: Option<NodeIndex>,
    pub(crate) children: Vec<NodeIndex>,
    pub(crate) full_name: String,
    pub(crate) slot: Mutex<ActorSlot>,
}

/// A built flow run: the actor arena plus the run-scoped storage, variables,
/// listeners and stop token.
pub struct Flow {
    id: String,
    title: String,
    description: String,
    graph: StableDiGraph<ActorNode, ()>,
    root: NodeIndex,
    storage: Storage,
    variables: Variables,
    listeners: Mutex<Vec<Box<dyn ExecutionListener>>>,
    records: Mutex<Vec<ActorRecord>>,
    stop: CancellationToken,
    definition: Value,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("actors", &self.graph.node_count())
            .finish()
    }
}

impl Flow {
    pub fn from_def(def: FlowDef) -> Result<Self, ActorError> {
        let definition = serde_json::to_value(&def)
            .map_err(|e| ActorError::Internal(format!("cannot serialize flow definition: {}", e)))?;
        let mut flow = Flow {
            id: def.id,
            title: def.title,
            description: def.description,
            graph: StableDiGraph::new(),
            root: NodeIndex::end(),
            storage: Storage::new(),
            variables: Variables::from_map(def.variables),
            listeners: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
            definition,
        };
        let root = flow.add_actor(None, def.root.0)?;
        flow.root = root;
        Ok(flow)
    }

    fn add_actor(
        &mut self,
        parent: Option<NodeIndex>,
        mut actor: Box<dyn Actor>,
    ) -> Result<NodeIndex, ActorError> {
        let full_name = match parent {
            Some(p) => format!("{}.{}", self.graph[p].full_name, actor.name()),
            None => actor.name().to_string(),
        };
        let mut children = actor.take_children();
        if children.is_empty() {
            if let Some(path) = actor.external_file() {
                let sub = FlowDef::load(&path)?;
                debug!("loaded external sub-flow '{}' into '{}'", sub.id, full_name);
                children.push(sub.root);
            }
        }
        let node = ActorNode {
            name: actor.name().to_string(),
            type_name: actor.type_name(),
            kind: actor.kind(),
            skip: actor.skip(),
            external: actor.external(),
            policy: actor.handler_policy(),
            parent,
            children: Vec::new(),
            full_name,
            slot: Mutex::new(ActorSlot {
                actor: None,
                set_up: false,
            }),
        };
        let id = self.graph.add_node(node);
        if let Some(p) = parent {
            self.graph.add_edge(p, id, ());
        }
        self.graph[id].slot.get_mut().unwrap().actor = Some(actor);
        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            child_ids.push(self.add_actor(Some(id), child.0)?);
        }
        self.graph[id].children = child_ids;
        Ok(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The raw definition this flow was built from.
    pub fn definition(&self) -> &Value {
        &self.definition
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn add_listener(&self, listener: Box<dyn ExecutionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Replaces the stop token, e.g. to tie the run to a registry entry.
    pub fn link_stop(&mut self, token: CancellationToken) {
        self.stop = token;
    }

    /// Requests a cooperative stop; every lifecycle call observes it.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn actor_count(&self) -> usize {
        self.graph.node_count()
    }

    pub(crate) fn node(&self, id: NodeIndex) -> &ActorNode {
        self.graph.node_weight(id).expect("unknown actor id")
    }

    pub fn full_name(&self, id: NodeIndex) -> &str {
        &self.node(id).full_name
    }

    /// Index of the named immediate child, if any.
    pub fn child_by_name(&self, parent: NodeIndex, name: &str) -> Option<NodeIndex> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).name == name)
    }

    fn preorder(&self, id: NodeIndex, out: &mut Vec<NodeIndex>) {
        out.push(id);
        for &child in &self.node(id).children {
            self.preorder(child, out);
        }
    }

    fn postorder(&self, id: NodeIndex, out: &mut Vec<NodeIndex>) {
        for &child in &self.node(id).children {
            self.postorder(child, out);
        }
        out.push(id);
    }

    /// Checks the structural rules every handler declares for its children.
    fn validate(&self) -> Result<(), ActorError> {
        let mut ids = Vec::new();
        self.preorder(self.root, &mut ids);
        for id in ids {
            let node = self.node(id);
            if node.children.is_empty() {
                continue;
            }
            let mut names = HashSet::new();
            for &child in &node.children {
                let child_name = &self.node(child).name;
                if !names.insert(child_name.clone()) {
                    return Err(ActorError::Restriction(format!(
                        "name '{}' is not unique within '{}'",
                        child_name, node.full_name
                    )));
                }
            }
            let Some(policy) = &node.policy else { continue };
            if let Some(slots) = policy.fixed_slots {
                if node.children.len() != slots.len() {
                    return Err(ActorError::Restriction(format!(
                        "'{}' expects exactly {} children ({}), got {}",
                        node.full_name,
                        slots.len(),
                        slots.join(", "),
                        node.children.len()
                    )));
                }
            }
            let mut sources = 0;
            for &child in &node.children {
                let child_node = self.node(child);
                match child_node.kind {
                    ActorKind::Source => {
                        sources += 1;
                        if !policy.allows_source {
                            return Err(ActorError::Restriction(format!(
                                "'{}' cannot contain the source '{}'",
                                node.full_name, child_node.name
                            )));
                        }
                    }
                    ActorKind::Standalone => {
                        if !policy.allows_standalones {
                            return Err(ActorError::Restriction(format!(
                                "'{}' cannot contain the standalone '{}'",
                                node.full_name, child_node.name
                            )));
                        }
                    }
                    _ => {}
                }
                if let Some(allowed) = policy.restrictions {
                    if !allowed.contains(&child_node.kind) {
                        return Err(ActorError::Restriction(format!(
                            "'{}' does not accept {} actors ('{}')",
                            node.full_name, child_node.kind, child_node.name
                        )));
                    }
                }
            }
            if policy.single_source && sources > 1 {
                return Err(ActorError::Restriction(format!(
                    "'{}' allows at most one source, found {}",
                    node.full_name, sources
                )));
            }
        }
        Ok(())
    }

    /// Structure validation without touching any actor.
    pub fn check(&self) -> Result<(), ActorError> {
        self.validate()
    }

    /// Validates the structure and sets up every non-skipped actor, top-down.
    /// Calling it again without `clean_up` in between is a no-op per actor.
    pub fn setup(&self) -> Result<(), ActorError> {
        self.validate()?;
        let mut ids = Vec::new();
        self.preorder(self.root, &mut ids);
        for id in ids {
            if self.node(id).skip {
                continue;
            }
            {
                let slot = self.node(id).slot.lock().unwrap();
                if slot.set_up {
                    continue;
                }
            }
            let ctx = ActorContext::new(self, id);
            self.with_actor(id, |actor| actor.setup(&ctx))?
                .map_err(|e| ActorError::Setup(format!("{}: {}", self.node(id).full_name, e)))?;
            self.node(id).slot.lock().unwrap().set_up = true;
        }
        Ok(())
    }

    /// Runs the root actor and collects the execution report.
    pub fn execute(&self) -> ExecutionReport {
        self.records.lock().unwrap().clear();
        let timer = Instant::now();
        let result = self.run_actor(self.root);
        let records: Vec<ActorRecord> = self.records.lock().unwrap().drain(..).collect();
        let error = result.err().map(|e| {
            let actor = records
                .iter()
                .find(|r| r.result.is_err())
                .map(|r| r.actor.clone())
                .unwrap_or_else(|| self.node(self.root).full_name.clone());
            (actor, e)
        });
        ExecutionReport {
            records,
            error,
            total_ms: timer.elapsed().as_millis() as i64,
        }
    }

    pub fn wrap_up(&self) {
        let mut ids = Vec::new();
        self.postorder(self.root, &mut ids);
        for id in ids {
            if self.node(id).skip {
                continue;
            }
            let _ = self.with_actor(id, |actor| actor.wrap_up());
        }
    }

    /// Tears every actor down and clears the run-scoped storage.
    pub fn clean_up(&self) {
        let mut ids = Vec::new();
        self.postorder(self.root, &mut ids);
        for id in ids {
            if self.node(id).skip {
                continue;
            }
            let _ = self.with_actor(id, |actor| actor.clean_up());
            self.node(id).slot.lock().unwrap().set_up = false;
        }
        self.storage.clear();
    }

    /// Full lifecycle: setup, execute, wrap up, clean up.
    pub fn run(&self) -> Result<ExecutionReport, ActorError> {
        self.setup()?;
        info!("flow '{}' running", self.id);
        let report = self.execute();
        self.wrap_up();
        self.clean_up();
        info!(
            "flow '{}' finished in {} ms ({} actor invocations)",
            self.id,
            report.total_ms,
            report.records.len()
        );
        Ok(report)
    }

    pub(crate) fn with_actor<R>(
        &self,
        id: NodeIndex,
        f: impl FnOnce(&mut Box<dyn Actor>) -> R,
    ) -> Result<R, ActorError> {
        let taken = self.node(id).slot.lock().unwrap().actor.take();
        let Some(mut actor) = taken else {
            return Err(ActorError::Internal(format!(
                "actor '{}' is already executing",
                self.node(id).full_name
            )));
        };
        let result = f(&mut actor);
        self.node(id).slot.lock().unwrap().actor = Some(actor);
        Ok(result)
    }

    fn notify(&self, phase: ExecutionPhase, id: NodeIndex, token: Option<&Token>) {
        let node = self.node(id);
        let event = ExecutionEvent {
            phase,
            actor_path: &node.full_name,
            actor_type: &node.type_name,
            token,
        };
        for listener in self.listeners.lock().unwrap().iter_mut() {
            listener.notify(&event);
        }
    }

    fn record(&self, id: NodeIndex, started: DateTime<Utc>, result: &Result<(), ActorError>) {
        self.records.lock().unwrap().push(ActorRecord {
            actor: self.node(id).full_name.clone(),
            started,
            finished: Utc::now(),
            result: result.clone(),
        });
    }

    /// Executes one actor. Skipped actors and stopped runs are no-ops.
    pub(crate) fn run_actor(&self, id: NodeIndex) -> Result<(), ActorError> {
        if self.is_stopped() || self.node(id).skip {
            return Ok(());
        }
        self.notify(ExecutionPhase::PreExecute, id, None);
        let started = Utc::now();
        let result = self
            .with_actor(id, |actor| actor.execute(&ActorContext::new(self, id)))
            .and_then(|r| r);
        self.notify(ExecutionPhase::PostExecute, id, None);
        self.record(id, started, &result);
        result
    }

    /// Hands one input token to an actor.
    pub(crate) fn feed(&self, id: NodeIndex, token: Token) -> Result<(), ActorError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.notify(ExecutionPhase::PreInput, id, Some(&token));
        let result = self.with_actor(id, |actor| actor.input(token)).and_then(|r| r);
        self.notify(ExecutionPhase::PostInput, id, None);
        result
    }

    /// Pulls one pending output token from an actor, if any.
    pub(crate) fn pull(&self, id: NodeIndex) -> Result<Option<Token>, ActorError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let pending = self.with_actor(id, |actor| actor.has_pending_output())?;
        if !pending {
            return Ok(None);
        }
        self.notify(ExecutionPhase::PreOutput, id, None);
        let mut token = self.with_actor(id, |actor| actor.output())?;
        if let Some(t) = token.as_mut() {
            if t.provenance().is_none() {
                t.set_provenance(&self.node(id).full_name);
            }
            self.notify(ExecutionPhase::PostOutput, id, Some(t));
        }
        Ok(token)
    }
}

/// Everything an actor may reach while it runs: its place in the tree, the
/// run-scoped storage/variables, child driving and callable resolution.
#[derive(Clone, Copy)]
pub struct ActorContext<'a> {
    flow: &'a Flow,
    id: NodeIndex,
}

impl<'a> ActorContext<'a> {
    pub(crate) fn new(flow: &'a Flow, id: NodeIndex) -> Self {
        Self { flow, id }
    }

    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    pub fn id(&self) -> NodeIndex {
        self.id
    }

    pub fn full_name(&self) -> &'a str {
        &self.flow.node(self.id).full_name
    }

    pub fn storage(&self) -> &'a Storage {
        self.flow.storage()
    }

    pub fn variables(&self) -> &'a Variables {
        self.flow.variables()
    }

    /// Expands variable references, including the dynamic namespaces.
    pub fn expand(&self, s: &str) -> String {
        self.flow.variables().expand(s, self)
    }

    pub fn children(&self) -> &'a [NodeIndex] {
        &self.flow.node(self.id).children
    }

    pub fn is_skipped(&self, id: NodeIndex) -> bool {
        self.flow.node(id).skip
    }

    pub fn kind_of(&self, id: NodeIndex) -> ActorKind {
        self.flow.node(id).kind
    }

    pub fn name_of(&self, id: NodeIndex) -> &'a str {
        &self.flow.node(id).name
    }

    pub fn stopped(&self) -> bool {
        self.flow.is_stopped()
    }

    pub fn run(&self, id: NodeIndex) -> Result<(), ActorError> {
        self.flow.run_actor(id)
    }

    pub fn feed(&self, id: NodeIndex, token: Token) -> Result<(), ActorError> {
        self.flow.feed(id, token)
    }

    pub fn pull(&self, id: NodeIndex) -> Result<Option<Token>, ActorError> {
        self.flow.pull(id)
    }

    /// Resolves a callable actor by walking outward from this actor.
    pub fn find_callable(&self, name: &str) -> Option<NodeIndex> {
        callable::find_callable(self.flow, self.id, name)
    }

    /// One-shot value from the named callable source actor.
    pub fn callable_source_value(&self, name: &str) -> Result<Value, ActorError> {
        callable::value_from_source(self.flow, self.id, name)
    }
}

impl DynamicLookup for ActorContext<'_> {
    fn callable_value(&self, name: &str) -> Result<String, String> {
        self.callable_source_value(name)
            .map(|v| variables::value_to_string(&v))
            .map_err(|e| e.to_string())
    }

    fn storage_value(&self, name: &str) -> Option<String> {
        self.flow
            .storage()
            .get(name)
            .map(|v| variables::value_to_string(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{Null, SetStorageValue, StringConstants};
    use crate::control::Sequence;

    fn simple_def() -> FlowDef {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["a".into(), "b".into()],
                ))),
                AnyActor(Box::new(SetStorageValue::new("store", "last"))),
                AnyActor(Box::new(Null::new("sink"))),
            ],
        );
        FlowDef {
            id: "simple".to_string(),
            title: "Simple".to_string(),
            description: String::new(),
            variables: HashMap::new(),
            root: AnyActor(Box::new(root)),
        }
    }

    #[test]
    fn test_build_computes_full_names() {
        let flow = Flow::from_def(simple_def()).unwrap();
        assert_eq!(flow.actor_count(), 4);
        let root = flow.root();
        assert_eq!(flow.full_name(root), "Flow");
        let src = flow.child_by_name(root, "src").unwrap();
        assert_eq!(flow.full_name(src), "Flow.src");
    }

    #[test]
    fn test_run_moves_tokens_through_chain() {
        let flow = Flow::from_def(simple_def()).unwrap();
        let report = flow.run().unwrap();
        assert!(report.succeeded());
        // storage is cleared by clean_up, so check the records instead
        assert!(report.records.iter().all(|r| r.result.is_ok()));
        assert!(report.records.iter().any(|r| r.actor == "Flow.store"));
    }

    #[test]
    fn test_setup_twice_is_idempotent() {
        let flow = Flow::from_def(simple_def()).unwrap();
        flow.setup().unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded());
    }

    #[test]
    fn test_duplicate_sibling_names_rejected() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new("dup", vec!["a".into()]))),
                AnyActor(Box::new(Null::new("dup"))),
            ],
        );
        let def = FlowDef {
            id: "dups".to_string(),
            title: String::new(),
            description: String::new(),
            variables: HashMap::new(),
            root: AnyActor(Box::new(root)),
        };
        let flow = Flow::from_def(def).unwrap();
        let err = flow.setup().unwrap_err();
        assert!(matches!(err, ActorError::Restriction(_)), "got {:?}", err);
    }

    #[test]
    fn test_stop_prevents_execution() {
        let flow = Flow::from_def(simple_def()).unwrap();
        flow.setup().unwrap();
        flow.stop();
        let report = flow.execute();
        assert!(report.records.is_empty());
    }

    #[test]
    fn test_definition_round_trip() {
        let flow = Flow::from_def(simple_def()).unwrap();
        let def: FlowDef = serde_json::from_value(flow.definition().clone()).unwrap();
        assert_eq!(def.id, "simple");
        let rebuilt = Flow::from_def(def).unwrap();
        assert_eq!(rebuilt.actor_count(), 4);
    }
}
