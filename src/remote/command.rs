use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::remote::connection::{ConnectionSpec, RemoteError};

/// Which listener a stop request is aimed at: the request-executing engine
/// or a paired response-side listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineScope {
    Request,
    Response,
}

impl std::fmt::Display for EngineScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineScope::Request => write!(f, "request"),
            EngineScope::Response => write!(f, "response"),
        }
    }
}

fn default_max_failures() -> i32 {
    -1
}

/// Request side of a command; the tag doubles as the wire type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum CommandRequest {
    Ping,
    ListFlows,
    GetFlow {
        id: String,
    },
    GetFlowState {
        id: String,
    },
    StopFlow {
        id: String,
    },
    StopEngine {
        scope: EngineScope,
    },
    StartRemoteLogging {
        host: String,
        port: u16,
        #[serde(default = "default_max_failures")]
        max_failures: i32,
    },
    StopRemoteLogging,
}

impl CommandRequest {
    pub fn type_tag(&self) -> &'static str {
        match self {
            CommandRequest::Ping => "Ping",
            CommandRequest::ListFlows => "ListFlows",
            CommandRequest::GetFlow { .. } => "GetFlow",
            CommandRequest::GetFlowState { .. } => "GetFlowState",
            CommandRequest::StopFlow { .. } => "StopFlow",
            CommandRequest::StopEngine { .. } => "StopEngine",
            CommandRequest::StartRemoteLogging { .. } => "StartRemoteLogging",
            CommandRequest::StopRemoteLogging => "StopRemoteLogging",
        }
    }

    /// Whether this command reports a result back when a response connection
    /// is present.
    pub fn wants_response(&self) -> bool {
        matches!(
            self,
            CommandRequest::Ping
                | CommandRequest::ListFlows
                | CommandRequest::GetFlow { .. }
                | CommandRequest::GetFlowState { .. }
                | CommandRequest::StartRemoteLogging { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl CommandResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            error_message: None,
            payload,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            success: false,
            error_message: Some(message),
            payload: Value::Null,
        }
    }

    pub fn failed_with_payload(message: String, payload: Value) -> Self {
        Self {
            success: false,
            error_message: Some(message),
            payload,
        }
    }
}

/// Self-describing unit exchanged over a connection: the request fields, an
/// optional response connection and, once executed, the response fields.
///
/// A command instance is single-use per request/response cycle; re-sending
/// goes through `for_resend`, which keeps the request and resets the
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RemoteCommand {
    #[serde(flatten)]
    pub request: CommandRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_connection: Option<ConnectionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CommandResponse>,
}

impl RemoteCommand {
    pub fn new(request: CommandRequest) -> Self {
        Self {
            request,
            response_connection: None,
            response: None,
        }
    }

    pub fn with_response_connection(mut self, spec: ConnectionSpec) -> Self {
        self.response_connection = Some(spec);
        self
    }

    pub fn type_tag(&self) -> &'static str {
        self.request.type_tag()
    }

    pub fn wants_response(&self) -> bool {
        self.request.wants_response()
    }

    /// Fresh instance for another cycle: request fields preserved, response
    /// fields reset.
    pub fn for_resend(&self) -> RemoteCommand {
        RemoteCommand {
            request: self.request.clone(),
            response_connection: self.response_connection.clone(),
            response: None,
        }
    }

    /// The executed command as sent back to a response listener.
    pub fn into_reply(self, response: CommandResponse) -> RemoteCommand {
        RemoteCommand {
            request: self.request,
            response_connection: None,
            response: Some(response),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, RemoteError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, RemoteError> {
        serde_json::from_slice(bytes).map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}
