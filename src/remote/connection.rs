use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::remote::command::RemoteCommand;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },
    #[error("i/o failure talking to {target}: {source}")]
    Io {
        target: String,
        source: std::io::Error,
    },
    #[error("cannot serialize command: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("engine is not in state '{expected}'")]
    EngineState { expected: String },
    #[error("log tap gave up after {attempts} failed connection attempts")]
    TapExhausted { attempts: i32 },
    #[error("log tap stopped")]
    TapStopped,
}

/// Where to reach a command listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
}

impl ConnectionSpec {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Sends serialized commands to a host:port. Stateless between calls: every
/// send opens a fresh stream, writes one command and closes the write side.
/// There is no built-in timeout; callers needing deadlines wrap the call.
#[derive(Debug, Clone)]
pub struct Connection {
    spec: ConnectionSpec,
}

impl Connection {
    pub fn new(spec: ConnectionSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub async fn send(&self, command: &RemoteCommand) -> Result<(), RemoteError> {
        let payload = command.to_wire()?;
        let mut stream =
            TcpStream::connect(self.spec.addr())
                .await
                .map_err(|e| RemoteError::Connect {
                    target: self.spec.to_string(),
                    source: e,
                })?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| RemoteError::Io {
                target: self.spec.to_string(),
                source: e,
            })?;
        stream.shutdown().await.map_err(|e| RemoteError::Io {
            target: self.spec.to_string(),
            source: e,
        })?;
        debug!("sent {} to {}", command.type_tag(), self.spec);
        Ok(())
    }
}
