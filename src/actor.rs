use std::fmt;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::flow::ActorContext;
use crate::token::Token;

/// Capability tag deciding how an actor takes part in token flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// Neither consumes nor produces tokens.
    Standalone,
    /// Produces tokens, consumes none.
    Source,
    /// Consumes one token, produces tokens.
    Transformer,
    /// Consumes one token, produces none.
    Sink,
}

impl ActorKind {
    pub fn consumes_input(self) -> bool {
        matches!(self, ActorKind::Transformer | ActorKind::Sink)
    }

    pub fn produces_output(self) -> bool {
        matches!(self, ActorKind::Source | ActorKind::Transformer)
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKind::Standalone => write!(f, "standalone"),
            ActorKind::Source => write!(f, "source"),
            ActorKind::Transformer => write!(f, "transformer"),
            ActorKind::Sink => write!(f, "sink"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActorError {
    /// Configuration problem caught while setting up.
    Setup(String),
    InvalidInput(String),
    ExecutionFailed(String),
    /// A named reference (callable actor, storage item, flow) did not resolve.
    NotFound(String),
    /// A structural rule of an actor handler was violated.
    Restriction(String),
    Internal(String),
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorError::Setup(msg) => write!(f, "Setup error: {}", msg),
            ActorError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ActorError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            ActorError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ActorError::Restriction(msg) => write!(f, "Restriction violated: {}", msg),
            ActorError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ActorError {}

/// How an actor handler drives its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Structural rules an actor handler declares for its children. Checked once
/// at setup time, before any child runs.
#[derive(Debug, Clone)]
pub struct HandlerPolicy {
    pub execution: ExecutionMode,
    pub allows_standalones: bool,
    pub allows_source: bool,
    /// At most one source child.
    pub single_source: bool,
    /// Hand the handler's own input token to its first child.
    pub forwards_input: bool,
    /// Immediate children are resolvable by name through callable references.
    pub callable_host: bool,
    /// Named structural roles, one per child position.
    pub fixed_slots: Option<&'static [&'static str]>,
    /// Child kinds permitted, if narrowed.
    pub restrictions: Option<&'static [ActorKind]>,
}

impl HandlerPolicy {
    pub fn sequential() -> Self {
        Self {
            execution: ExecutionMode::Sequential,
            allows_standalones: false,
            allows_source: false,
            single_source: false,
            forwards_input: false,
            callable_host: false,
            fixed_slots: None,
            restrictions: None,
        }
    }

    pub fn parallel() -> Self {
        Self {
            execution: ExecutionMode::Parallel,
            ..Self::sequential()
        }
    }
}

/// Unit of work in the dataflow tree.
///
/// Lifecycle: `setup` once per run (repeat calls before `clean_up` are
/// no-ops), then any number of `input`/`execute`/`output` cycles, then
/// `wrap_up` and `clean_up`. All failures come back as `ActorError` values.
#[typetag::serde]
pub trait Actor: Send + Sync + Debug {
    /// Name unique within the hosting container.
    fn name(&self) -> &str;

    /// Declared type of this actor, e.g. "sequence".
    fn type_name(&self) -> String;

    fn kind(&self) -> ActorKind;

    /// A skipped actor keeps its structural slot but is bypassed entirely.
    fn skip(&self) -> bool {
        false
    }

    /// Present when this actor owns children.
    fn handler_policy(&self) -> Option<HandlerPolicy> {
        None
    }

    /// Whether this actor hosts an externally-loaded sub-flow.
    fn external(&self) -> bool {
        false
    }

    /// File to load the external sub-flow from, if any.
    fn external_file(&self) -> Option<PathBuf> {
        None
    }

    /// Drains the declared children so the flow can take ownership of them.
    fn take_children(&mut self) -> Vec<AnyActor> {
        Vec::new()
    }

    fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    fn input(&mut self, _token: Token) -> Result<(), ActorError> {
        Err(ActorError::InvalidInput(format!(
            "'{}' does not accept input",
            self.name()
        )))
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError>;

    fn has_pending_output(&self) -> bool {
        false
    }

    fn output(&mut self) -> Option<Token> {
        None
    }

    fn wrap_up(&mut self) {}

    fn clean_up(&mut self) {}

    fn clone_actor(&self) -> Box<dyn Actor>;
}

#[derive(Serialize, Deserialize)]
pub struct AnyActor(pub Box<dyn Actor>);

impl Deref for AnyActor {
    type Target = dyn Actor;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for AnyActor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl Clone for AnyActor {
    fn clone(&self) -> Self {
        AnyActor(self.0.clone_actor())
    }
}

impl fmt::Debug for AnyActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyActor").field(&self.0).finish()
    }
}
