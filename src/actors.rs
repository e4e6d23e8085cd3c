use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actor::{Actor, ActorError, ActorKind};
use crate::flow::ActorContext;
use crate::token::Token;

/// Best-effort numeric view of a payload for expression evaluation: strings
/// holding a number are treated as that number.
fn coerce_numeric(payload: Value) -> Value {
    match payload {
        Value::String(s) => match s.parse::<f64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

pub(crate) fn payload_dynamic(token: &Token) -> Result<rhai::Dynamic, ActorError> {
    rhai::serde::to_dynamic(coerce_numeric(token.payload()))
        .map_err(|e| ActorError::ExecutionFailed(format!("payload conversion: {}", e)))
}

/// Source emitting one token per configured string. Strings go through
/// variable expansion each time the actor executes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StringConstants {
    name: String,
    #[serde(default)]
    skip: bool,
    strings: Vec<String>,
    #[serde(skip)]
    #[schemars(skip)]
    pending: Vec<Token>,
}

impl StringConstants {
    pub fn new(name: &str, strings: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            strings,
            pending: Vec::new(),
        }
    }

    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }
}

#[typetag::serde(name = "string_constants")]
impl Actor for StringConstants {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "string_constants".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Source
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        self.pending = self
            .strings
            .iter()
            .map(|s| Token::new(Value::String(ctx.expand(s))))
            .collect();
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.pending.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Source reading one value from flow storage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageValue {
    name: String,
    #[serde(default)]
    skip: bool,
    storage_name: String,
    #[serde(skip)]
    #[schemars(skip)]
    pending: Vec<Token>,
}

impl StorageValue {
    pub fn new(name: &str, storage_name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            storage_name: storage_name.to_string(),
            pending: Vec::new(),
        }
    }
}

#[typetag::serde(name = "storage_value")]
impl Actor for StorageValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "storage_value".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Source
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        if !crate::storage::Storage::is_valid_name(&self.storage_name) {
            return Err(ActorError::Setup(format!(
                "invalid storage name '{}'",
                self.storage_name
            )));
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        match ctx.storage().get(&self.storage_name) {
            Some(value) => {
                self.pending.push(Token::new(value));
                Ok(())
            }
            None => Err(ActorError::NotFound(format!(
                "storage item '{}'",
                self.storage_name
            ))),
        }
    }

    fn has_pending_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.pending.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Transformer writing the token payload into storage and passing the token
/// along untouched.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetStorageValue {
    name: String,
    #[serde(default)]
    skip: bool,
    storage_name: String,
    #[serde(skip)]
    #[schemars(skip)]
    pending: Vec<Token>,
}

impl SetStorageValue {
    pub fn new(name: &str, storage_name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            storage_name: storage_name.to_string(),
            pending: Vec::new(),
        }
    }
}

#[typetag::serde(name = "set_storage_value")]
impl Actor for SetStorageValue {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "set_storage_value".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Transformer
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        if !crate::storage::Storage::is_valid_name(&self.storage_name) {
            return Err(ActorError::Setup(format!(
                "invalid storage name '{}'",
                self.storage_name
            )));
        }
        Ok(())
    }

    fn input(&mut self, token: Token) -> Result<(), ActorError> {
        self.pending.push(token);
        Ok(())
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        if let Some(token) = self.pending.first() {
            ctx.storage().put(&self.storage_name, token.payload());
        }
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.pending.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Standalone setting a flow variable; the value goes through variable
/// expansion first.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetVariable {
    name: String,
    #[serde(default)]
    skip: bool,
    var_name: String,
    var_value: String,
}

impl SetVariable {
    pub fn new(name: &str, var_name: &str, var_value: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            var_name: var_name.to_string(),
            var_value: var_value.to_string(),
        }
    }
}

#[typetag::serde(name = "set_variable")]
impl Actor for SetVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "set_variable".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn execute(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let value = ctx.expand(&self.var_value);
        ctx.variables().set(&self.var_name, &value);
        Ok(())
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Transformer evaluating an expression over the payload (bound as `x`).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct Expression {
    name: String,
    #[serde(default)]
    skip: bool,
    expression: String,
    #[serde(skip)]
    #[schemars(skip)]
    input: Option<Token>,
    #[serde(skip)]
    #[schemars(skip)]
    pending: Vec<Token>,
}

impl Expression {
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
            expression: expression.to_string(),
            input: None,
            pending: Vec::new(),
        }
    }

    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }
}

impl Clone for Expression {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            skip: self.skip,
            expression: self.expression.clone(),
            input: None,
            pending: Vec::new(),
        }
    }
}

#[typetag::serde(name = "expression")]
impl Actor for Expression {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "expression".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Transformer
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        if self.expression.trim().is_empty() {
            return Err(ActorError::Setup("empty expression".to_string()));
        }
        Ok(())
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
        let expression = ctx.expand(&self.expression);
        let engine = rhai::Engine::new();
        let mut scope = rhai::Scope::new();
        scope.push_dynamic("x", payload_dynamic(&token)?);
        let result = engine
            .eval_expression_with_scope::<rhai::Dynamic>(&mut scope, &expression)
            .map_err(|e| {
                ActorError::ExecutionFailed(format!("expression '{}' failed: {}", expression, e))
            })?;
        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| ActorError::ExecutionFailed(format!("expression result: {}", e)))?;
        self.pending.push(Token::new(value));
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        !self.pending.is_empty()
    }

    fn output(&mut self) -> Option<Token> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    fn wrap_up(&mut self) {
        self.input = None;
        self.pending.clear();
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

/// Sink that consumes and discards its input.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Null {
    name: String,
    #[serde(default)]
    skip: bool,
}

impl Null {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skip: false,
        }
    }
}

#[typetag::serde(name = "null")]
impl Actor for Null {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "null".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Sink
    }

    fn skip(&self) -> bool {
        self.skip
    }

    fn input(&mut self, _token: Token) -> Result<(), ActorError> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}
