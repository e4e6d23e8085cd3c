use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::remote::command::RemoteCommand;

/// Observer on the receiving side, notified for every inbound request and
/// for protocol failures (bind errors, undeserializable payloads). Handlers
/// never decide whether a command executes; they only watch.
pub trait RequestHandler: Send {
    fn request_received(&mut self, command: &RemoteCommand);

    fn request_failed(&mut self, command: Option<&RemoteCommand>, error: &str);
}

/// Observer notified when an executed command comes back over a response
/// listener.
pub trait ResponseHandler: Send {
    fn response_received(&mut self, command: &RemoteCommand);

    fn response_failed(&mut self, command: &RemoteCommand, error: &str);
}

/// Logs every request at info level, failures at warn.
pub struct LoggingRequestHandler;

impl RequestHandler for LoggingRequestHandler {
    fn request_received(&mut self, command: &RemoteCommand) {
        info!("request: {}", command.type_tag());
    }

    fn request_failed(&mut self, command: Option<&RemoteCommand>, error: &str) {
        match command {
            Some(cmd) => warn!("request {} failed: {}", cmd.type_tag(), error),
            None => warn!("request failed: {}", error),
        }
    }
}

/// Keeps every observed request, for tests and operator tooling.
#[derive(Default)]
pub struct CollectingRequestHandler {
    received: Arc<Mutex<Vec<RemoteCommand>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl CollectingRequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Arc<Mutex<Vec<RemoteCommand>>> {
        Arc::clone(&self.received)
    }

    pub fn failures(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.failures)
    }
}

impl RequestHandler for CollectingRequestHandler {
    fn request_received(&mut self, command: &RemoteCommand) {
        self.received.lock().unwrap().push(command.clone());
    }

    fn request_failed(&mut self, _command: Option<&RemoteCommand>, error: &str) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

/// Keeps every observed response, successes and failures apart.
#[derive(Default)]
pub struct CollectingResponseHandler {
    received: Arc<Mutex<Vec<RemoteCommand>>>,
    failed: Arc<Mutex<Vec<RemoteCommand>>>,
}

impl CollectingResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Arc<Mutex<Vec<RemoteCommand>>> {
        Arc::clone(&self.received)
    }

    pub fn failed(&self) -> Arc<Mutex<Vec<RemoteCommand>>> {
        Arc::clone(&self.failed)
    }
}

impl ResponseHandler for CollectingResponseHandler {
    fn response_received(&mut self, command: &RemoteCommand) {
        self.received.lock().unwrap().push(command.clone());
    }

    fn response_failed(&mut self, command: &RemoteCommand, error: &str) {
        warn!("response {} failed: {}", command.type_tag(), error);
        self.failed.lock().unwrap().push(command.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::command::CommandRequest;

    #[test]
    fn test_collecting_request_handler() {
        let mut handler = CollectingRequestHandler::new();
        let received = handler.received();
        let failures = handler.failures();

        handler.request_received(&RemoteCommand::new(CommandRequest::Ping));
        handler.request_failed(None, "boom");

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(failures.lock().unwrap()[0], "boom");
    }

    #[test]
    fn test_collecting_response_handler_splits_outcomes() {
        let mut handler = CollectingResponseHandler::new();
        let received = handler.received();
        let failed = handler.failed();

        let ok = RemoteCommand::new(CommandRequest::ListFlows);
        handler.response_received(&ok);
        handler.response_failed(&ok, "unreachable");

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(failed.lock().unwrap().len(), 1);
    }
}
