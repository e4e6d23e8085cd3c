use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use flowbench::actor::{Actor, ActorError, ActorKind, AnyActor};
use flowbench::actors::{Null, SetStorageValue, SetVariable, StringConstants};
use flowbench::control::{CallableActors, Sequence};
use flowbench::execution::breakpoint::Breakpoint;
use flowbench::execution::debug::{ControlSurface, DebugListener};
use flowbench::execution::listener::{ExecutionPhase, LoggingListener, TimingListener};
use flowbench::flow::ActorContext;
use flowbench::variables::NOT_FOUND;
use flowbench::{Flow, FlowDef};

fn def(root: Sequence) -> FlowDef {
    FlowDef {
        id: "it".to_string(),
        title: String::new(),
        description: String::new(),
        variables: HashMap::new(),
        root: AnyActor(Box::new(root)),
    }
}

/// Standalone that counts its lifecycle calls; used to observe setup
/// idempotence from the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LifecycleProbe {
    name: String,
    #[serde(skip)]
    setups: Arc<AtomicUsize>,
}

impl LifecycleProbe {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            setups: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[typetag::serde(name = "lifecycle_probe")]
impl Actor for LifecycleProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> String {
        "lifecycle_probe".to_string()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Standalone
    }

    fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    fn clone_actor(&self) -> Box<dyn Actor> {
        Box::new(self.clone())
    }
}

#[test]
fn setup_twice_acquires_resources_once() {
    let probe = LifecycleProbe::new("probe");
    let setups = Arc::clone(&probe.setups);
    let root = Sequence::with_children("Flow", vec![AnyActor(Box::new(probe))]);
    let flow = Flow::from_def(def(root)).unwrap();

    flow.setup().unwrap();
    flow.setup().unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 1);

    // after a clean_up the next setup really runs again
    flow.clean_up();
    flow.setup().unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 2);
}

#[test]
fn storage_variable_expansion_degrades_to_sentinel() {
    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(StringConstants::new(
                "src",
                vec!["value=${storage:absent}".into()],
            ))),
            AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        flow.storage().get("seen"),
        Some(json!(format!("value={}", NOT_FOUND)))
    );
}

#[test]
fn variables_flow_from_standalones_into_sources() {
    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(SetVariable::new("setter", "env", "prod"))),
            AnyActor(Box::new(StringConstants::new(
                "src",
                vec!["deploy to ${env}".into()],
            ))),
            AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(flow.storage().get("seen"), Some(json!("deploy to prod")));
}

#[test]
fn callable_values_are_fresh_on_every_expansion() {
    // the callable source reads a variable that changes between uses
    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(CallableActors::with_children(
                "callables",
                vec![AnyActor(Box::new(StringConstants::new(
                    "current",
                    vec!["${counter}".into()],
                )))],
            ))),
            AnyActor(Box::new(SetVariable::new("one", "counter", "1"))),
            AnyActor(Box::new(SetVariable::new(
                "first_read",
                "a",
                "${callable:current}",
            ))),
            AnyActor(Box::new(SetVariable::new("two", "counter", "2"))),
            AnyActor(Box::new(SetVariable::new(
                "second_read",
                "b",
                "${callable:current}",
            ))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(flow.variables().get("a"), Some("1".to_string()));
    assert_eq!(flow.variables().get("b"), Some("2".to_string()));
}

struct CountingSurface {
    hits: Arc<std::sync::Mutex<Vec<(String, ExecutionPhase)>>>,
}

impl ControlSurface for CountingSurface {
    fn breakpoint_reached(&self, actor_path: &str, phase: ExecutionPhase) {
        self.hits
            .lock()
            .unwrap()
            .push((actor_path.to_string(), phase));
    }
}

#[test]
fn pre_execute_breakpoint_triggers_once_per_execution() {
    let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
    let surface = Arc::new(CountingSurface {
        hits: Arc::clone(&hits),
    });

    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(StringConstants::new(
                "src",
                vec!["a".into(), "b".into()],
            ))),
            AnyActor(Box::new(Null::new("sink"))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    flow.add_listener(Box::new(DebugListener::new(
        vec![Breakpoint::for_path("Flow.src").on_pre_execute()],
        surface,
    )));
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded(), "{:?}", report.error);

    let hits = hits.lock().unwrap();
    // the source executes once even though it emits two tokens
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "Flow.src");
    assert_eq!(hits[0].1, ExecutionPhase::PreExecute);
}

#[test]
fn timing_listener_covers_a_real_run() {
    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(StringConstants::new("src", vec!["x".into()]))),
            AnyActor(Box::new(Null::new("sink"))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    let timing = TimingListener::new(1);
    let snapshot = timing.snapshot();
    flow.add_listener(Box::new(timing));
    flow.add_listener(Box::new(LoggingListener::new()));
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded());

    let view = snapshot.read().unwrap();
    assert!(view.contains_key("Flow.src execute"));
    assert!(view.contains_key("Flow.sink input"));
}

#[test]
fn flow_file_round_trip_through_yaml() {
    let yaml = r#"
id: file_demo
title: From a file
variables:
  who: world
root:
  sequence:
    name: Flow
    children:
      - string_constants:
          name: src
          strings: ["hi ${who}"]
      - set_storage_value:
          name: keep
          storage_name: seen
      - "null":
          name: sink
"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.yaml");
    std::fs::write(&path, yaml).unwrap();

    let flow = Flow::from_def(FlowDef::load(&path).unwrap()).unwrap();
    assert_eq!(flow.id(), "file_demo");
    flow.setup().unwrap();
    let report = flow.execute();
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(flow.storage().get("seen"), Some(json!("hi world")));
}

#[test]
fn report_records_every_invocation_in_order() {
    let root = Sequence::with_children(
        "Flow",
        vec![
            AnyActor(Box::new(StringConstants::new("src", vec!["x".into()]))),
            AnyActor(Box::new(Null::new("sink"))),
        ],
    );
    let flow = Flow::from_def(def(root)).unwrap();
    let report = flow.run().unwrap();
    let actors: Vec<&str> = report.records.iter().map(|r| r.actor.as_str()).collect();
    assert_eq!(actors, vec!["Flow.src", "Flow.sink", "Flow"]);
}
