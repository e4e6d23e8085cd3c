use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use petgraph::graph::NodeIndex;
use rhai::Engine;

use crate::actor::{Actor, ActorError, ActorKind, AnyActor, HandlerPolicy};
use crate::flow::ActorContext;
use crate::token::Token;

/// Drives a chain of actors, feeding every produced token depth-first into
/// the remainder of the chain, one token at a time. Tokens reaching the end
/// of the chain land in `collected`.
pub(crate) fn flow_through(
    ctx: &ActorContext,
    chain: &[NodeIndex],
    input: Option<Token>,
    collected: &mut Vec<Token>,
) -> Result<(), ActorError> {
    let Some((&first, rest)) = chain.split_first() else {
        if let Some(token) = input {
            collected.push(token);
        }
        return Ok(());
    };
    if ctx.is_skipped(first) {
        return flow_through(ctx, rest, input, collected);
    }
    match ctx.kind_of(first) {
        ActorKind::Standalone => {
            ctx.run(first)?;
            flow_through(ctx, rest, input, collected)
        }
        ActorKind::Source => {
            ctx.run(first)?;
            while let Some(token) = ctx.pull(first)? {
                flow_through(ctx, rest, Some(token), collected)?;
                if ctx.stopped() {
                    break;
                }
            }
            Ok(())
        }
        ActorKind::Transformer => {
            let Some(token) = input else {
                return Err(ActorError::InvalidInput(format!(
                    "'{}' expects an input token",
                    ctx.name_of(first)
                )));
            };
            ctx.feed(first, token)?;
            ctx.run(first)?;
            while let Some(out) = ctx.pull(first)? {
                flow_through(ctx, rest, Some(out), collected)?;
                if ctx.stopped() {
                    break;
                }
            }
            Ok(())
        }
        ActorKind::Sink => {
            let Some(token) = input else {
                return Err(ActorError::InvalidInput(format!(
                    "'{}' expects an input token",
                    ctx.name_of(first)
                )));
            };
            ctx.feed(first, token)?;
            ctx.run(first)
        }
    }
}

/// Standalone container running its children in declared order: leading
/// standalones first, then the source-fed chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    name: String,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    children: Vec<AnyActor>,
}

impl Sequence {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(name: &str, children: Vec<AnyActor>) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children,
        }
    }

    pub fn add(mut self, child: AnyActor) -> Self {
        self.children.push(child);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }
}

#[typetag::serde(name = "sequence")]
impl Actor for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "sequence".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            allows_standalones: true,
            allows_source: true,
            single_source: true,
            ..HandlerPolicy::sequential()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        std::mem::take(&mut self.children)
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let children = ctx.children();
        let mut idx = 0;
        while idx < children.len() && ctx.kind_of(children[idx]) == ActorKind::Standalone {
            if !ctx.is_skipped(children[idx]) {
                ctx.run(children[idx])?;
            }
            idx += 1;
        }
        let mut discarded = Vec::new();
        flow_through(ctx, &children[idx..], None, &mut discarded)
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Transformer container: forwards its own input to the first child and
/// offers the last child's outputs as its own.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubProcess {
    name: String,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    children: Vec<AnyActor>,
    #[serde(skip)]
    input: Option<Token>,
    #[serde(skip)]
    collected: Vec<Token>,
}

impl SubProcess {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children: Vec::new(),
            input: None,
            collected: Vec::new(),
        }
    }

    pub fn with_children(name: &str, children: Vec<AnyActor>) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children,
            input: None,
            collected: Vec::new(),
        }
    }
}

impl Clone for SubProcess {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            skip: self.skip,
            children: self.children.clone(),
            input: None,
            collected: Vec::new(),
        }
    }
}

#[typetag::serde(name = "sub_process")]
impl Actor for SubProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "sub_process".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Transformer
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            forwards_input: true,
            ..HandlerPolicy::sequential()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        std::mem::take(&mut self.children)
    }

    fn input(&mut self, token: Token) -> Result<(), ActorError> {
        self.input = Some(token);
        Ok(())
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let input = self.input.take();
        flow_through(ctx, ctx.children(), input, &mut self.collected)
    }

    fn has_pending_output(&self) -> bool {
        !self.collected.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.collected.is_empty() {
            None
        } else {
            Some(self.collected.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.input = None;
        self.collected.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Runs standalone children concurrently and joins all of them before
/// reporting; the first child error wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parallel {
    name: String,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    children: Vec<AnyActor>,
}

impl Parallel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(name: &str, children: Vec<AnyActor>) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children,
        }
    }
}

const PARALLEL_CHILD_KINDS: &[ActorKind] = &[ActorKind::Standalone];

#[typetag::serde(name = "parallel")]
impl Actor for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "parallel".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            allows_standalones: true,
            restrictions: Some(PARALLEL_CHILD_KINDS),
            ..HandlerPolicy::parallel()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        std::mem::take(&mut self.children)
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let kids: Vec<NodeIndex> = ctx
            .children()
            .iter()
            .copied()
            .filter(|&c| !ctx.is_skipped(c))
            .collect();
        let mut first_err = None;
        std::thread::scope(|scope| {
            let handles: Vec<_> = kids
                .iter()
                .map(|&child| {
                    let branch_ctx = *ctx;
                    scope.spawn(move || branch_ctx.run(child))
                })
                .collect();
            for handle in handles {
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err(ActorError::Internal("branch thread panicked".into())));
                if let Err(e) = outcome {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Two fixed structural slots; the input token is routed to `then` or `else`
/// depending on a boolean expression over the payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct IfThenElse {
    name: String,
    #[serde(default)]
    skip: bool,
    condition: String,
    #[serde(default)]
    then: Option<AnyActor>,
    #[serde(default, rename = "else")]
    otherwise: Option<AnyActor>,
    #[serde(skip)]
    input: Option<Token>,
    #[serde(skip)]
    collected: Vec<Token>,
}

impl IfThenElse {
    pub fn new(name: &str, condition: &str, then: AnyActor, otherwise: AnyActor) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            condition: condition.to_string(),
            then: Some(then),
            otherwise: Some(otherwise),
            input: None,
            collected: Vec::new(),
        }
    }

    fn evaluate(&self, token: &Token) -> Result<bool, ActorError> {
        let engine = Engine::new();
        let mut scope = rhai::Scope::new();
        scope.push_dynamic("payload", crate::actors::payload_dynamic(token)?);
        engine
            .eval_expression_with_scope::<bool>(&mut scope, &self.condition)
            .map_err(|e| {
                ActorError::ExecutionFailed(format!(
                    "condition '{}' failed: {}",
                    self.condition, e
                ))
            })
    }
}

impl Clone for IfThenElse {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            skip: self.skip,
            condition: self.condition.clone(),
            then: self.then.clone(),
            otherwise: self.otherwise.clone(),
            input: None,
            collected: Vec::new(),
        }
    }
}

const IF_THEN_ELSE_SLOTS: &[&str] = &["then", "else"];

#[typetag::serde(name = "if_then_else")]
impl Actor for IfThenElse {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "if_then_else".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Transformer
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            forwards_input: true,
            fixed_slots: Some(IF_THEN_ELSE_SLOTS),
            ..HandlerPolicy::sequential()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        self.then
            .take()
            .into_iter()
            .chain(self.otherwise.take())
            .collect()
    }

    fn input(&mut self, token: Token) -> Result<(), ActorError> {
        self.input = Some(token);
        Ok(())
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let Some(token) = self.input.take() else {
            return Err(ActorError::InvalidInput(format!(
                "'{}' expects an input token",
                self.name
            )));
        };
        let branch = if self.evaluate(&token)? { 0 } else { 1 };
        let child = ctx.children()[branch];
        flow_through(ctx, &[child], Some(token), &mut self.collected)
    }

    fn has_pending_output(&self) -> bool {
        !self.collected.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.collected.is_empty() {
            None
        } else {
            Some(self.collected.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.input = None;
        self.collected.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Hosts actors that are resolved by name through callable references.
/// Children are set up with the rest of the tree but never driven directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallableActors {
    name: String,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    children: Vec<AnyActor>,
}

impl CallableActors {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(name: &str, children: Vec<AnyActor>) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            children,
        }
    }
}

#[typetag::serde(name = "callable_actors")]
impl Actor for CallableActors {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "callable_actors".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            allows_standalones: true,
            allows_source: true,
            callable_host: true,
            ..HandlerPolicy::sequential()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        std::mem::take(&mut self.children)
    }

    fn execute(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        // children only run when referenced
        Ok(())
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Grafts another flow into this one, either inline or loaded from a file at
/// build time. Callable resolution descends into the grafted tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFlow {
    name: String,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    flow: Option<AnyActor>,
}

impl ExternalFlow {
    pub fn from_file(name: &str, file: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            file: Some(file),
            flow: None,
        }
    }

    pub fn inline(name: &str, root: AnyActor) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            file: None,
            flow: Some(root),
        }
    }
}

#[typetag::serde(name = "external_flow")]
impl Actor for ExternalFlow {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "external_flow".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn external(&self) -> bool {
        true
    }

    fn external_file(&self) -> Option<PathBuf> {
        if self.flow.is_none() {
            self.file.clone()
        } else {
            None
        }
    }

    fn handler_policy(&self) -> Option<HandlerPolicy> {
        Some(HandlerPolicy {
            allows_standalones: true,
            allows_source: true,
            ..HandlerPolicy::sequential()
        })
    }

    fn take_children(&mut self) -> Vec<AnyActor> {
        self.flow.take().into_iter().collect()
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        for &child in ctx.children() {
            if !ctx.is_skipped(child) {
                ctx.run(child)?;
            }
        }
        Ok(())
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{Expression, Null, SetStorageValue, SetVariable, StringConstants};
    use crate::flow::{Flow, FlowDef};
    use serde_json::json;
    use std::collections::HashMap;

    fn def_with_root(root: AnyActor) -> FlowDef {
        FlowDef {
            id: "test".to_string(),
            title: String::new(),
            description: String::new(),
            variables: HashMap::new(),
            root,
        }
    }

    #[test]
    fn test_sequence_chains_tokens() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["1".into(), "2".into(), "3".into()],
                ))),
                AnyActor(Box::new(Expression::new("inc", "x + 1"))),
                AnyActor(Box::new(SetStorageValue::new("keep", "last"))),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        // strings parse as numbers inside the expression, last is 3 + 1
        assert_eq!(flow.storage().get("last"), Some(json!(4.0)));
    }

    #[test]
    fn test_skipped_transformer_is_bypassed() {
        let mut inc = Expression::new("inc", "x + 1");
        inc.set_skip(true);
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new("src", vec!["7".into()]))),
                AnyActor(Box::new(inc)),
                AnyActor(Box::new(SetStorageValue::new("keep", "last"))),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded());
        // token passed the skipped actor untouched
        assert_eq!(flow.storage().get("last"), Some(json!("7")));
    }

    #[test]
    fn test_sub_process_offers_last_child_outputs() {
        let sub = SubProcess::with_children(
            "sub",
            vec![AnyActor(Box::new(Expression::new("double", "x * 2")))],
        );
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new("src", vec!["5".into()]))),
                AnyActor(Box::new(sub)),
                AnyActor(Box::new(SetStorageValue::new("keep", "result"))),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("result"), Some(json!(10.0)));
    }

    #[test]
    fn test_parallel_runs_all_children() {
        let root = Sequence::with_children(
            "Flow",
            vec![AnyActor(Box::new(Parallel::with_children(
                "par",
                vec![
                    AnyActor(Box::new(SetVariable::new("a", "va", "1"))),
                    AnyActor(Box::new(SetVariable::new("b", "vb", "2"))),
                    AnyActor(Box::new(SetVariable::new("c", "vc", "3"))),
                ],
            )))],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.variables().get("va"), Some("1".to_string()));
        assert_eq!(flow.variables().get("vb"), Some("2".to_string()));
        assert_eq!(flow.variables().get("vc"), Some("3".to_string()));
    }

    #[test]
    fn test_parallel_rejects_non_standalone_children() {
        let root = Parallel::with_children(
            "Flow",
            vec![AnyActor(Box::new(Null::new("sink")))],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        let err = flow.setup().unwrap_err();
        assert!(matches!(err, ActorError::Restriction(_)));
    }

    #[test]
    fn test_if_then_else_routes_by_condition() {
        let branch = IfThenElse::new(
            "gate",
            "payload > 10.0",
            AnyActor(Box::new(SetStorageValue::new("big", "big"))),
            AnyActor(Box::new(SetStorageValue::new("small", "small"))),
        );
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["5".into(), "15".into()],
                ))),
                AnyActor(Box::new(branch)),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("big"), Some(json!("15")));
        assert_eq!(flow.storage().get("small"), Some(json!("5")));
    }

    #[test]
    fn test_if_then_else_requires_both_slots() {
        let mut branch = IfThenElse::new(
            "gate",
            "true",
            AnyActor(Box::new(Null::new("then"))),
            AnyActor(Box::new(Null::new("else"))),
        );
        branch.otherwise = None;
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new("src", vec!["x".into()]))),
                AnyActor(Box::new(branch)),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        let err = flow.setup().unwrap_err();
        assert!(matches!(err, ActorError::Restriction(_)));
    }

    #[test]
    fn test_callable_actors_are_not_driven() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(StringConstants::new(
                        "shared",
                        vec!["never".into()],
                    )))],
                ))),
                AnyActor(Box::new(StringConstants::new("src", vec!["x".into()]))),
                AnyActor(Box::new(Null::new("sink"))),
            ],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded());
        assert!(
            !report
                .records
                .iter()
                .any(|r| r.actor == "Flow.callables.shared"),
            "callable child must not run on its own"
        );
    }

    #[test]
    fn test_external_flow_inline_runs_grafted_tree() {
        let sub_root = Sequence::with_children(
            "Sub",
            vec![
                AnyActor(Box::new(StringConstants::new("src", vec!["deep".into()]))),
                AnyActor(Box::new(SetStorageValue::new("keep", "from_sub"))),
            ],
        );
        let root = Sequence::with_children(
            "Flow",
            vec![AnyActor(Box::new(ExternalFlow::inline(
                "ext",
                AnyActor(Box::new(sub_root)),
            )))],
        );
        let flow = Flow::from_def(def_with_root(AnyActor(Box::new(root)))).unwrap();
        flow.setup().unwrap();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("from_sub"), Some(json!("deep")));
    }

    #[test]
    fn test_handler_serde_round_trip() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new("src", vec!["a".into()]))),
                AnyActor(Box::new(Null::new("sink"))),
            ],
        );
        let json = serde_json::to_string(&AnyActor(Box::new(root))).unwrap();
        let back: AnyActor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "Flow");
        assert_eq!(back.type_name(), "sequence");
    }
}
