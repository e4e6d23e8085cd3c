//! Actor dataflow execution core with a socket-based remote command
//! protocol.
//!
//! A flow is a tree of actors exchanging tokens; composite handlers drive
//! their children sequentially or in parallel, callable actors are resolved
//! by name across the tree, and `${...}` variables expand against flat
//! values, storage content or callable output. Runs are observable through
//! execution listeners (logging, timing, breakpoints) and controllable from
//! another process through the scripting engine.

pub mod actor;
pub mod actors;
pub mod callable;
pub mod config;
pub mod control;
pub mod execution;
pub mod flow;
pub mod logger;
pub mod registry;
pub mod remote;
pub mod storage;
pub mod token;
pub mod variables;

pub use actor::{Actor, ActorError, ActorKind, AnyActor};
pub use flow::{ActorContext, ExecutionReport, Flow, FlowDef};
pub use registry::{FlowRegistry, FlowState};
pub use remote::command::{CommandRequest, CommandResponse, EngineScope, RemoteCommand};
pub use remote::connection::{Connection, ConnectionSpec, RemoteError};
pub use remote::engine::{EngineContext, EngineState, ScriptingEngine};
pub use storage::Storage;
pub use token::Token;
pub use variables::Variables;
