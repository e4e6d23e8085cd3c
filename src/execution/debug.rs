use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rhai::Engine;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::execution::breakpoint::Breakpoint;
use crate::execution::listener::{ExecutionEvent, ExecutionListener, ExecutionPhase};

/// Receives control when a breakpoint triggers. Implementations decide what
/// suspension means: block the run, hand over to a remote operator, or just
/// record the hit.
pub trait ControlSurface: Send + Sync {
    fn breakpoint_reached(&self, actor_path: &str, phase: ExecutionPhase);
}

/// Default control surface: blocks the executing thread until `resume` is
/// called or the run is cancelled.
pub struct BlockingControl {
    paused: Mutex<bool>,
    resumed: Condvar,
    stop: CancellationToken,
}

impl BlockingControl {
    pub fn new(stop: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            stop,
        })
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.resumed.notify_all();
    }
}

impl ControlSurface for BlockingControl {
    fn breakpoint_reached(&self, actor_path: &str, phase: ExecutionPhase) {
        info!("suspended at {} ({})", actor_path, phase);
        let mut paused = self.paused.lock().unwrap();
        *paused = true;
        while *paused && !self.stop.is_cancelled() {
            let (guard, _) = self
                .resumed
                .wait_timeout(paused, Duration::from_millis(50))
                .unwrap();
            paused = guard;
        }
    }
}

/// Execution listener evaluating a set of breakpoints on every callback and
/// handing positive results to the control surface.
pub struct DebugListener {
    breakpoints: Vec<Breakpoint>,
    engine: Engine,
    control: Arc<dyn ControlSurface>,
}

impl DebugListener {
    pub fn new(breakpoints: Vec<Breakpoint>, control: Arc<dyn ControlSurface>) -> Self {
        Self {
            breakpoints,
            engine: Engine::new(),
            control,
        }
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }
}

impl ExecutionListener for DebugListener {
    fn notify(&mut self, event: &ExecutionEvent<'_>) {
        let engine = &self.engine;
        for bp in self.breakpoints.iter_mut() {
            if bp.evaluate(engine, event) {
                self.control.breakpoint_reached(event.actor_path, event.phase);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSurface {
        hits: AtomicUsize,
    }

    impl ControlSurface for CountingSurface {
        fn breakpoint_reached(&self, _actor_path: &str, _phase: ExecutionPhase) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event(phase: ExecutionPhase) -> ExecutionEvent<'static> {
        ExecutionEvent {
            phase,
            actor_path: "Flow.actor",
            actor_type: "null",
            token: None,
        }
    }

    #[test]
    fn test_debug_listener_dispatches_to_control() {
        let surface = Arc::new(CountingSurface {
            hits: AtomicUsize::new(0),
        });
        let mut listener = DebugListener::new(
            vec![Breakpoint::for_path("Flow.actor").on_pre_execute()],
            surface.clone(),
        );
        // one full invocation cycle: only the pre-execute phase may hit
        listener.notify(&event(ExecutionPhase::PreInput));
        listener.notify(&event(ExecutionPhase::PostInput));
        listener.notify(&event(ExecutionPhase::PreExecute));
        listener.notify(&event(ExecutionPhase::PostExecute));
        listener.notify(&event(ExecutionPhase::PreOutput));
        listener.notify(&event(ExecutionPhase::PostOutput));
        assert_eq!(surface.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_control_resumes() {
        let stop = CancellationToken::new();
        let control = BlockingControl::new(stop);
        let control2 = Arc::clone(&control);
        let handle = std::thread::spawn(move || {
            control2.breakpoint_reached("Flow.actor", ExecutionPhase::PreExecute);
        });
        // wait until the thread reports paused, then release it
        while !control.is_paused() {
            std::thread::yield_now();
        }
        control.resume();
        handle.join().unwrap();
        assert!(!control.is_paused());
    }

    #[test]
    fn test_blocking_control_released_by_cancellation() {
        let stop = CancellationToken::new();
        let control = BlockingControl::new(stop.clone());
        let control2 = Arc::clone(&control);
        let handle = std::thread::spawn(move || {
            control2.breakpoint_reached("Flow.actor", ExecutionPhase::PreExecute);
        });
        while !control.is_paused() {
            std::thread::yield_now();
        }
        stop.cancel();
        handle.join().unwrap();
    }
}
