use petgraph::graph::NodeIndex;
use serde_json::Value;
use tracing::debug;

use crate::actor::{ActorError, ActorKind};
use crate::flow::{ActorContext, Flow};
use crate::token::Token;

/// Scans one handler level: every immediate callable-host child is searched
/// for the name, and externally-loaded sub-flows are descended into.
fn scan_level(flow: &Flow, handler: NodeIndex, name: &str) -> Option<NodeIndex> {
    for &child in &flow.node(handler).children {
        let child_node = flow.node(child);
        if child_node
            .policy
            .as_ref()
            .is_some_and(|p| p.callable_host)
        {
            for &hosted in &child_node.children {
                if flow.node(hosted).name == name {
                    return Some(hosted);
                }
            }
        }
        if child_node.external {
            for &sub_root in &child_node.children {
                if let Some(hit) = scan_level(flow, sub_root, name) {
                    return Some(hit);
                }
            }
        }
    }
    None
}

/// Resolves a callable actor by name, walking outward from `from` through
/// every ancestor handler. First match wins; names are only validated unique
/// within one hosting container, so a shadowed duplicate further out is
/// possible and reported at debug level.
pub fn find_callable(flow: &Flow, from: NodeIndex, name: &str) -> Option<NodeIndex> {
    let mut first = None;
    let mut current = flow.node(from).parent;
    while let Some(ancestor) = current {
        if let Some(hit) = scan_level(flow, ancestor, name) {
            if first.is_none() {
                first = Some(hit);
            } else if first != Some(hit) {
                debug!(
                    "callable actor '{}' at '{}' shadows '{}'",
                    name,
                    flow.full_name(first.unwrap()),
                    flow.full_name(hit)
                );
            }
        }
        current = flow.node(ancestor).parent;
    }
    first
}

fn one_shot(flow: &Flow, id: NodeIndex, input: Option<Token>) -> Result<Value, ActorError> {
    // run a full lifecycle against a clone so the resolved actor's own
    // state is left untouched
    let mut actor = flow.with_actor(id, |a| a.clone_actor())?;
    let ctx = ActorContext::new(flow, id);
    actor.setup(&ctx)?;
    if let Some(token) = input {
        actor.input(token)?;
    }
    let result = actor.execute(&ctx);
    let token = match &result {
        Ok(()) if actor.has_pending_output() => actor.output(),
        _ => None,
    };
    actor.wrap_up();
    actor.clean_up();
    result?;
    match token {
        Some(t) => Ok(t.into_payload()),
        None => Err(ActorError::ExecutionFailed(format!(
            "callable actor '{}' produced no output",
            flow.full_name(id)
        ))),
    }
}

/// One-shot value from a callable source actor: resolve, run a full
/// setup/execute/output/wrap-up/clean-up cycle, return the single output.
pub fn value_from_source(flow: &Flow, from: NodeIndex, name: &str) -> Result<Value, ActorError> {
    let Some(id) = find_callable(flow, from, name) else {
        return Err(ActorError::NotFound(format!("callable actor '{}'", name)));
    };
    if flow.node(id).kind != ActorKind::Source {
        return Err(ActorError::InvalidInput(format!(
            "callable actor '{}' is not a source",
            name
        )));
    }
    one_shot(flow, id, None)
}

/// Like `value_from_source`, but pushes one input token through a callable
/// transformer.
pub fn value_from_transformer(
    flow: &Flow,
    from: NodeIndex,
    name: &str,
    input: Token,
) -> Result<Value, ActorError> {
    let Some(id) = find_callable(flow, from, name) else {
        return Err(ActorError::NotFound(format!("callable actor '{}'", name)));
    };
    if flow.node(id).kind != ActorKind::Transformer {
        return Err(ActorError::InvalidInput(format!(
            "callable actor '{}' is not a transformer",
            name
        )));
    }
    one_shot(flow, id, Some(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::AnyActor;
    use crate::actors::{Expression, Null, SetStorageValue, StringConstants};
    use crate::control::{CallableActors, ExternalFlow, Sequence};
    use crate::flow::FlowDef;
    use crate::variables::NOT_FOUND;
    use serde_json::json;
    use std::collections::HashMap;

    fn build(root: Sequence) -> Flow {
        let def = FlowDef {
            id: "callable".to_string(),
            title: String::new(),
            description: String::new(),
            variables: HashMap::new(),
            root: AnyActor(Box::new(root)),
        };
        let flow = Flow::from_def(def).unwrap();
        flow.setup().unwrap();
        flow
    }

    /// Outer level hosts 'shared' -> "outer"; the inner sequence hosts its
    /// own 'shared' -> "inner" and reads it through a callable variable.
    fn shadowed_flow() -> Flow {
        let inner = Sequence::with_children(
            "inner",
            vec![
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(StringConstants::new(
                        "shared",
                        vec!["inner".into()],
                    )))],
                ))),
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["${callable:shared}".into()],
                ))),
                AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
            ],
        );
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(StringConstants::new(
                        "shared",
                        vec!["outer".into()],
                    )))],
                ))),
                AnyActor(Box::new(inner)),
            ],
        );
        build(root)
    }

    #[test]
    fn test_inner_scope_wins_over_outer() {
        let flow = shadowed_flow();
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("seen"), Some(json!("inner")));
    }

    #[test]
    fn test_resolution_is_declaration_order_independent() {
        // callable container declared after the actor that references it
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["${callable:late}".into()],
                ))),
                AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(StringConstants::new(
                        "late",
                        vec!["works".into()],
                    )))],
                ))),
            ],
        );
        let flow = build(root);
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("seen"), Some(json!("works")));
    }

    #[test]
    fn test_missing_callable_is_a_configuration_error() {
        let flow = shadowed_flow();
        let root = flow.root();
        let inner = flow.child_by_name(root, "inner").unwrap();
        let src = flow.child_by_name(inner, "src").unwrap();
        assert!(find_callable(&flow, src, "nobody").is_none());
        let err = value_from_source(&flow, src, "nobody").unwrap_err();
        assert!(matches!(err, ActorError::NotFound(_)));
    }

    #[test]
    fn test_non_source_callable_yields_sentinel_in_expansion() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(Null::new("dump")))],
                ))),
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["${callable:dump}".into()],
                ))),
                AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
            ],
        );
        let flow = build(root);
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("seen"), Some(json!(NOT_FOUND)));
    }

    #[test]
    fn test_resolution_descends_into_external_sub_flows() {
        let sub_root = Sequence::with_children(
            "Sub",
            vec![AnyActor(Box::new(CallableActors::with_children(
                "callables",
                vec![AnyActor(Box::new(StringConstants::new(
                    "from_ext",
                    vec!["external".into()],
                )))],
            )))],
        );
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(ExternalFlow::inline(
                    "ext",
                    AnyActor(Box::new(sub_root)),
                ))),
                AnyActor(Box::new(StringConstants::new(
                    "src",
                    vec!["${callable:from_ext}".into()],
                ))),
                AnyActor(Box::new(SetStorageValue::new("keep", "seen"))),
            ],
        );
        let flow = build(root);
        let report = flow.execute();
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(flow.storage().get("seen"), Some(json!("external")));
    }

    #[test]
    fn test_value_from_transformer_round_trip() {
        let root = Sequence::with_children(
            "Flow",
            vec![
                AnyActor(Box::new(CallableActors::with_children(
                    "callables",
                    vec![AnyActor(Box::new(Expression::new("triple", "x * 3")))],
                ))),
                AnyActor(Box::new(StringConstants::new("src", vec!["x".into()]))),
                AnyActor(Box::new(Null::new("sink"))),
            ],
        );
        let flow = build(root);
        let root_id = flow.root();
        let src = flow.child_by_name(root_id, "src").unwrap();
        let value =
            value_from_transformer(&flow, src, "triple", Token::new(json!(2.0))).unwrap();
        assert_eq!(value, json!(6.0));
        // wrong kind is rejected
        let err = value_from_source(&flow, src, "triple").unwrap_err();
        assert!(matches!(err, ActorError::InvalidInput(_)));
    }

    #[test]
    fn test_callable_state_is_untouched_by_one_shot() {
        let flow = shadowed_flow();
        let root = flow.root();
        let inner = flow.child_by_name(root, "inner").unwrap();
        let src = flow.child_by_name(inner, "src").unwrap();
        let first = value_from_source(&flow, src, "shared").unwrap();
        let second = value_from_source(&flow, src, "shared").unwrap();
        assert_eq!(first, second);
    }
}
