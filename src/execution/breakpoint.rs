use rhai::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::execution::listener::{ExecutionEvent, ExecutionPhase};

/// Which actors a breakpoint applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorScope {
    /// Exact match on the declared actor type, e.g. "expression".
    TypeName(String),
    /// Exact match on the full actor path, e.g. "Flow.branch.actor".
    FullPath(String),
}

impl ActorScope {
    fn matches(&self, event: &ExecutionEvent<'_>) -> bool {
        match self {
            ActorScope::TypeName(name) => event.actor_type == name,
            ActorScope::FullPath(path) => event.actor_path == path,
        }
    }
}

/// A guarded predicate evaluated at enabled lifecycle points. Evaluation is
/// boolean only; suspension is the business of whoever evaluates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub on_pre_input: bool,
    #[serde(default)]
    pub on_post_input: bool,
    #[serde(default)]
    pub on_pre_execute: bool,
    #[serde(default)]
    pub on_post_execute: bool,
    #[serde(default)]
    pub on_pre_output: bool,
    #[serde(default)]
    pub on_post_output: bool,
    pub scope: ActorScope,
    /// Optional boolean expression over `name`, `path`, `phase` and
    /// `payload`. Evaluation errors count as no trigger.
    #[serde(default)]
    pub condition: Option<String>,
    /// Disable automatically after the first trigger.
    #[serde(default)]
    pub one_off: bool,
    #[serde(skip)]
    trigger_count: usize,
}

impl Breakpoint {
    pub fn for_path(path: &str) -> Self {
        Self::new(ActorScope::FullPath(path.to_string()))
    }

    pub fn for_type(type_name: &str) -> Self {
        Self::new(ActorScope::TypeName(type_name.to_string()))
    }

    fn new(scope: ActorScope) -> Self {
        Self {
            disabled: false,
            on_pre_input: false,
            on_post_input: false,
            on_pre_execute: false,
            on_post_execute: false,
            on_pre_output: false,
            on_post_output: false,
            scope,
            condition: None,
            one_off: false,
            trigger_count: 0,
        }
    }

    pub fn on_pre_execute(mut self) -> Self {
        self.on_pre_execute = true;
        self
    }

    pub fn on_pre_input(mut self) -> Self {
        self.on_pre_input = true;
        self
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn one_off(mut self) -> Self {
        self.one_off = true;
        self
    }

    pub fn trigger_count(&self) -> usize {
        self.trigger_count
    }

    fn watches(&self, phase: ExecutionPhase) -> bool {
        match phase {
            ExecutionPhase::PreInput => self.on_pre_input,
            ExecutionPhase::PostInput => self.on_post_input,
            ExecutionPhase::PreExecute => self.on_pre_execute,
            ExecutionPhase::PostExecute => self.on_post_execute,
            ExecutionPhase::PreOutput => self.on_pre_output,
            ExecutionPhase::PostOutput => self.on_post_output,
        }
    }

    fn condition_holds(&self, engine: &Engine, event: &ExecutionEvent<'_>) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };
        let mut scope = rhai::Scope::new();
        let name = event
            .actor_path
            .rsplit('.')
            .next()
            .unwrap_or(event.actor_path);
        scope.push("name", name.to_string());
        scope.push("path", event.actor_path.to_string());
        scope.push("phase", event.phase.to_string());
        let payload = match event.token {
            Some(token) => rhai::serde::to_dynamic(token.payload()).unwrap_or(rhai::Dynamic::UNIT),
            None => rhai::Dynamic::UNIT,
        };
        scope.push_dynamic("payload", payload);
        match engine.eval_expression_with_scope::<bool>(&mut scope, condition) {
            Ok(result) => result,
            Err(e) => {
                warn!("breakpoint condition '{}' failed: {}", condition, e);
                false
            }
        }
    }

    /// Whether the breakpoint triggers for this event.
    pub fn evaluate(&mut self, engine: &Engine, event: &ExecutionEvent<'_>) -> bool {
        if self.disabled || !self.watches(event.phase) || !self.scope.matches(event) {
            return false;
        }
        if !self.condition_holds(engine, event) {
            return false;
        }
        self.trigger_count += 1;
        if self.one_off {
            self.disabled = true;
        }
        true
    }
}
