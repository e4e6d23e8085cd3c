use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::remote::logging::{LogBus, LogRecord};
use crate::token::Token;

/// The six observable points of one actor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPhase {
    PreInput,
    PostInput,
    PreExecute,
    PostExecute,
    PreOutput,
    PostOutput,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::PreInput => "pre-input",
            ExecutionPhase::PostInput => "post-input",
            ExecutionPhase::PreExecute => "pre-execute",
            ExecutionPhase::PostExecute => "post-execute",
            ExecutionPhase::PreOutput => "pre-output",
            ExecutionPhase::PostOutput => "post-output",
        };
        write!(f, "{}", name)
    }
}

/// One lifecycle callback. The token is present on pre-input and post-output.
pub struct ExecutionEvent<'a> {
    pub phase: ExecutionPhase,
    pub actor_path: &'a str,
    pub actor_type: &'a str,
    pub token: Option<&'a Token>,
}

/// Observer of every actor's lifecycle during a run.
pub trait ExecutionListener: Send {
    fn notify(&mut self, event: &ExecutionEvent<'_>);
}

/// Appends one line per callback: millisecond timestamp, full actor path,
/// phase and a short message. Mirrors each line onto the remote log bus when
/// one is attached.
pub struct LoggingListener {
    bus: Option<LogBus>,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self { bus: None }
    }

    pub fn with_bus(bus: LogBus) -> Self {
        Self { bus: Some(bus) }
    }
}

impl Default for LoggingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionListener for LoggingListener {
    fn notify(&mut self, event: &ExecutionEvent<'_>) {
        let timestamp = Utc::now().timestamp_millis();
        let message = match event.token {
            Some(token) => format!("token #{:016x}", token.payload_hash()),
            None => "-".to_string(),
        };
        info!(
            target: "flowbench::execution",
            "{} {} {} {}",
            timestamp, event.actor_path, event.phase, message
        );
        if let Some(bus) = &self.bus {
            bus.publish(LogRecord {
                timestamp_ms: timestamp,
                level: "info".to_string(),
                source: event.actor_path.to_string(),
                message: format!("{} {}", event.phase, message),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimedPhase {
    Input,
    Execute,
    Output,
}

impl fmt::Display for TimedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimedPhase::Input => write!(f, "input"),
            TimedPhase::Execute => write!(f, "execute"),
            TimedPhase::Output => write!(f, "output"),
        }
    }
}

impl ExecutionPhase {
    fn timed(self) -> (TimedPhase, bool) {
        match self {
            ExecutionPhase::PreInput => (TimedPhase::Input, true),
            ExecutionPhase::PostInput => (TimedPhase::Input, false),
            ExecutionPhase::PreExecute => (TimedPhase::Execute, true),
            ExecutionPhase::PostExecute => (TimedPhase::Execute, false),
            ExecutionPhase::PreOutput => (TimedPhase::Output, true),
            ExecutionPhase::PostOutput => (TimedPhase::Output, false),
        }
    }
}

/// Shared, periodically refreshed view of accumulated timings, keyed by
/// "actor-path phase".
pub type TimingSnapshot = Arc<RwLock<HashMap<String, Duration>>>;

/// Accumulates wall-clock time per (actor, phase) pair across the whole run.
/// The snapshot refresh is gated by an event counter, not wall-clock, to
/// bound overhead.
pub struct TimingListener {
    refresh_every: usize,
    events: usize,
    starts: HashMap<(String, TimedPhase), Instant>,
    totals: HashMap<(String, TimedPhase), Duration>,
    snapshot: TimingSnapshot,
}

impl TimingListener {
    pub fn new(refresh_every: usize) -> Self {
        Self {
            refresh_every: refresh_every.max(1),
            events: 0,
            starts: HashMap::new(),
            totals: HashMap::new(),
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        Arc::clone(&self.snapshot)
    }

    fn refresh(&self) {
        let mut view = self.snapshot.write().unwrap();
        view.clear();
        for ((actor, phase), total) in &self.totals {
            view.insert(format!("{} {}", actor, phase), *total);
        }
    }
}

impl ExecutionListener for TimingListener {
    fn notify(&mut self, event: &ExecutionEvent<'_>) {
        let (phase, is_start) = event.phase.timed();
        let key = (event.actor_path.to_string(), phase);
        if is_start {
            self.starts.insert(key, Instant::now());
        } else if let Some(started) = self.starts.remove(&key) {
            *self.totals.entry(key).or_default() += started.elapsed();
        }
        self.events += 1;
        if self.events % self.refresh_every == 0 {
            self.refresh();
        }
    }
}
