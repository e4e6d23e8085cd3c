use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::remote::connection::{ConnectionSpec, RemoteError};

/// One log line streamed over a tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: i64,
    pub level: String,
    pub source: String,
    pub message: String,
}

/// Process-wide pub/sub channel for log records. Publishing never blocks and
/// silently drops records while nobody listens.
#[derive(Clone)]
pub struct LogBus {
    sender: broadcast::Sender<LogRecord>,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, record: LogRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Running tap task; stopping is cooperative via the token.
#[derive(Debug)]
pub struct TapHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl TapHandle {
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn connect_with_budget(
    target: &ConnectionSpec,
    max_failures: i32,
    stop: &CancellationToken,
) -> Result<TcpStream, RemoteError> {
    let mut failures = 0i32;
    loop {
        if stop.is_cancelled() {
            return Err(RemoteError::TapStopped);
        }
        match TcpStream::connect(target.addr()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                failures += 1;
                debug!(
                    "log tap connection to {} failed (attempt {}): {}",
                    target, failures, e
                );
                if max_failures >= 0 && failures >= max_failures.max(1) {
                    return Err(RemoteError::TapExhausted { attempts: failures });
                }
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn forward(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<LogRecord>,
    target: ConnectionSpec,
    max_failures: i32,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = rx.recv() => match received {
                Ok(record) => {
                    let mut line = match serde_json::to_vec(&record) {
                        Ok(line) => line,
                        Err(_) => continue,
                    };
                    line.push(b'\n');
                    if stream.write_all(&line).await.is_err() {
                        // consecutive-failure budget applies to reconnects too
                        match connect_with_budget(&target, max_failures, &stop).await {
                            Ok(fresh) => {
                                stream = fresh;
                                let _ = stream.write_all(&line).await;
                            }
                            Err(e) => {
                                warn!("remote log tap to {} ended: {}", target, e);
                                break;
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("log tap lagged, skipped {} records", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Streams log records from the process-wide bus to a remote listener over
/// its own socket, independent of the command channel.
pub struct RemoteLogTap;

impl RemoteLogTap {
    /// Connects and starts forwarding. With a non-negative budget the
    /// initial connect phase consumes it and exhaustion is reported as an
    /// error; with -1 the tap retries in the background indefinitely.
    pub async fn start(
        bus: LogBus,
        target: ConnectionSpec,
        max_failures: i32,
    ) -> Result<TapHandle, RemoteError> {
        let stop = CancellationToken::new();
        let rx = bus.subscribe();
        if max_failures >= 0 {
            let stream = connect_with_budget(&target, max_failures, &stop).await?;
            let task = tokio::spawn(forward(stream, rx, target, max_failures, stop.clone()));
            Ok(TapHandle { stop, task })
        } else {
            let stop_task = stop.clone();
            let task = tokio::spawn(async move {
                match connect_with_budget(&target, -1, &stop_task).await {
                    Ok(stream) => forward(stream, rx, target, -1, stop_task).await,
                    Err(_) => {}
                }
            });
            Ok(TapHandle { stop, task })
        }
    }
}
