use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::FlowRegistry;
use crate::remote::command::{
    CommandRequest, CommandResponse, EngineScope, RemoteCommand,
};
use crate::remote::connection::{Connection, RemoteError};
use crate::remote::handler::{RequestHandler, ResponseHandler};
use crate::remote::logging::{LogBus, RemoteLogTap, TapHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// What command execution may touch: the flow registry, the log bus and the
/// currently running log tap.
pub struct EngineContext {
    registry: Arc<FlowRegistry>,
    log_bus: LogBus,
    tap: Mutex<Option<TapHandle>>,
}

impl EngineContext {
    pub fn new(registry: Arc<FlowRegistry>, log_bus: LogBus) -> Arc<Self> {
        Arc::new(Self {
            registry,
            log_bus,
            tap: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn log_bus(&self) -> &LogBus {
        &self.log_bus
    }

    fn set_tap(&self, handle: TapHandle) {
        let mut tap = self.tap.lock().unwrap();
        if let Some(old) = tap.take() {
            old.stop();
        }
        *tap = Some(handle);
    }

    fn stop_tap(&self) -> bool {
        match self.tap.lock().unwrap().take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }
}

impl CommandRequest {
    /// Executes the request in-process and produces the response fields.
    pub(crate) async fn perform(&self, ctx: &EngineContext) -> CommandResponse {
        match self {
            CommandRequest::Ping => CommandResponse::ok(json!("pong")),
            CommandRequest::ListFlows => CommandResponse::ok(json!(ctx.registry().ids())),
            CommandRequest::GetFlow { id } => match ctx.registry().definition(id) {
                Some(def) => CommandResponse::ok(def),
                None => CommandResponse::failed(format!("unknown flow '{}'", id)),
            },
            CommandRequest::GetFlowState { id } => match ctx.registry().state(id) {
                Some(state) => CommandResponse::ok(json!(state.to_string())),
                None => CommandResponse::failed(format!("unknown flow '{}'", id)),
            },
            CommandRequest::StopFlow { id } => {
                if ctx.registry().stop_flow(id) {
                    CommandResponse::ok(Value::Null)
                } else {
                    CommandResponse::failed(format!("unknown flow '{}'", id))
                }
            }
            CommandRequest::StopEngine { .. } => {
                // handled by the engine before execution
                CommandResponse::ok(Value::Null)
            }
            CommandRequest::StartRemoteLogging {
                host,
                port,
                max_failures,
            } => {
                let target = crate::remote::connection::ConnectionSpec::new(host, *port);
                match RemoteLogTap::start(ctx.log_bus().clone(), target, *max_failures).await {
                    Ok(handle) => {
                        ctx.set_tap(handle);
                        CommandResponse::ok(Value::Null)
                    }
                    Err(e) => {
                        let echo = serde_json::to_value(self).unwrap_or(Value::Null);
                        CommandResponse::failed_with_payload(e.to_string(), echo)
                    }
                }
            }
            CommandRequest::StopRemoteLogging => {
                if ctx.stop_tap() {
                    CommandResponse::ok(Value::Null)
                } else {
                    CommandResponse::failed("no log tap running".to_string())
                }
            }
        }
    }
}

/// Listens on a port, deserializes one command per accepted connection,
/// notifies the registered handlers and executes or dispatches the command
/// according to its scope. Replies travel over a freshly opened connection
/// to the command's response descriptor, independent of the inbound channel.
pub struct ScriptingEngine {
    port: u16,
    scope: EngineScope,
    state: Mutex<EngineState>,
    bound: Mutex<Option<SocketAddr>>,
    request_handlers: Mutex<Vec<Box<dyn RequestHandler>>>,
    response_handlers: Mutex<Vec<Box<dyn ResponseHandler>>>,
    context: Arc<EngineContext>,
    shutdown: CancellationToken,
}

impl ScriptingEngine {
    pub fn new(port: u16, scope: EngineScope, context: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            port,
            scope,
            state: Mutex::new(EngineState::Stopped),
            bound: Mutex::new(None),
            request_handlers: Mutex::new(Vec::new()),
            response_handlers: Mutex::new(Vec::new()),
            context,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn scope(&self) -> EngineScope {
        self.scope
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    /// Actual bound address, available once the engine is listening. Useful
    /// when the engine was configured with port 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    pub fn add_request_handler(&self, handler: Box<dyn RequestHandler>) {
        self.request_handlers.lock().unwrap().push(handler);
    }

    pub fn add_response_handler(&self, handler: Box<dyn ResponseHandler>) {
        self.response_handlers.lock().unwrap().push(handler);
    }

    /// Unblocks the accept loop and finishes in `Stopped`.
    pub fn stop_execution(&self) {
        self.shutdown.cancel();
    }

    /// Polls until the engine reached `Listening`, up to the timeout.
    pub async fn wait_until_listening(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state() == EngineState::Listening {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    fn notify_request_received(&self, command: &RemoteCommand) {
        for handler in self.request_handlers.lock().unwrap().iter_mut() {
            handler.request_received(command);
        }
    }

    fn notify_request_failed(&self, command: Option<&RemoteCommand>, error: &str) {
        for handler in self.request_handlers.lock().unwrap().iter_mut() {
            handler.request_failed(command, error);
        }
    }

    /// Binds the port and runs the accept loop until an explicit stop. Bind
    /// and deserialize failures are reported to the request handlers, never
    /// raised out of the loop once listening.
    pub async fn execute(&self) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != EngineState::Stopped {
                return Err(RemoteError::EngineState {
                    expected: "stopped".to_string(),
                });
            }
            *state = EngineState::Starting;
        }
        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.notify_request_failed(None, &format!("cannot bind port {}: {}", self.port, e));
                self.set_state(EngineState::Stopped);
                return Err(RemoteError::Bind {
                    port: self.port,
                    source: e,
                });
            }
        };
        if let Ok(addr) = listener.local_addr() {
            *self.bound.lock().unwrap() = Some(addr);
        }
        self.set_state(EngineState::Listening);
        info!(
            "{} engine listening on port {}",
            self.scope,
            self.bound_addr().map(|a| a.port()).unwrap_or(self.port)
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {}", peer);
                        // one command per connection, handled before the
                        // next accept
                        self.handle_connection(stream).await;
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
        self.set_state(EngineState::Stopping);
        drop(listener);
        self.set_state(EngineState::Stopped);
        info!("{} engine stopped", self.scope);
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let mut buffer = Vec::new();
        if let Err(e) = stream.read_to_end(&mut buffer).await {
            self.notify_request_failed(None, &format!("cannot read command: {}", e));
            return;
        }
        match RemoteCommand::from_wire(&buffer) {
            Ok(command) => self.process(command).await,
            Err(e) => self.notify_request_failed(None, &e.to_string()),
        }
    }

    async fn process(&self, command: RemoteCommand) {
        self.notify_request_received(&command);
        if let CommandRequest::StopEngine { scope } = &command.request {
            if *scope == self.scope {
                info!("{} engine stop requested", self.scope);
                self.shutdown.cancel();
            } else {
                debug!("ignoring stop request scoped to {}", scope);
            }
            return;
        }
        match self.scope {
            EngineScope::Request => {
                let response = command.request.perform(&self.context).await;
                if command.wants_response() {
                    if let Some(spec) = command.response_connection.clone() {
                        let reply = command.for_resend().into_reply(response);
                        if let Err(e) = Connection::new(spec).send(&reply).await {
                            self.notify_request_failed(Some(&reply), &e.to_string());
                        }
                    }
                }
            }
            EngineScope::Response => {
                let error = command
                    .response
                    .as_ref()
                    .filter(|r| !r.success)
                    .and_then(|r| r.error_message.clone());
                let mut handlers = self.response_handlers.lock().unwrap();
                match error {
                    Some(message) => {
                        for handler in handlers.iter_mut() {
                            handler.response_failed(&command, &message);
                        }
                    }
                    None => {
                        for handler in handlers.iter_mut() {
                            handler.response_received(&command);
                        }
                    }
                }
            }
        }
    }
}
