mod common;

use common::runtime_with;
use meshcore::{Flow, FlowError, OnError, OutputMap, RetryPolicy, Step, ValidationError};
use serde_json::json;

fn validation_error(result: Result<meshcore::ExecutionRecord, FlowError>) -> ValidationError {
    match result {
        Err(FlowError::Validation(err)) => err,
        other => panic!("expected a validation error, got {:?}", other.map(|r| r.status)),
    }
}

#[tokio::test]
async fn test_unknown_action_fails_before_any_step_runs() {
    let runtime = runtime_with(vec![]);
    let mut events = runtime.subscribe_events();
    let flow = Flow::new("typo")
        .with_step(Step::new("ok", "echo"))
        .with_step(Step::new("bad", "htp_request"));

    let err = validation_error(runtime.execute(&flow, OutputMap::new()).await);

    assert_eq!(
        err,
        ValidationError::UnknownAction {
            step_id: "bad".to_string(),
            action: "htp_request".to_string(),
        }
    );
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn test_unknown_action_inside_nested_block() {
    let runtime = runtime_with(vec![]);
    let flow = Flow::new("nested-typo").with_step(
        Step::new("each", "for_each")
            .with_config("items", json!([1]))
            .with_child(Step::new("inner", "nope")),
    );

    let err = validation_error(runtime.execute(&flow, OutputMap::new()).await);
    assert!(matches!(err, ValidationError::UnknownAction { step_id, .. } if step_id == "inner"));
}

#[tokio::test]
async fn test_duplicate_step_ids_rejected() {
    let runtime = runtime_with(vec![]);
    let flow = Flow::new("dupes")
        .with_step(Step::new("same", "echo"))
        .with_teardown(Step::new("same", "echo"));

    let err = validation_error(runtime.execute(&flow, OutputMap::new()).await);
    assert_eq!(err, ValidationError::DuplicateStepId("same".to_string()));
}

#[test]
fn test_malformed_step_settings_rejected() {
    let runtime = runtime_with(vec![]);

    let zero_attempts = Flow::new("retry").with_step(Step::new("s", "echo").with_retry(RetryPolicy::new(0)));
    assert!(matches!(
        runtime.validate(&zero_attempts),
        Err(FlowError::Validation(ValidationError::InvalidStep { .. }))
    ));

    let bad_delay =
        Flow::new("delay").with_step(Step::new("s", "echo").with_retry(RetryPolicy::new(2).with_delay("soon")));
    assert!(matches!(
        runtime.validate(&bad_delay),
        Err(FlowError::Validation(ValidationError::InvalidDuration(_)))
    ));

    let no_handler = Flow::new("handle").with_step(Step::new("s", "echo").with_on_error(OnError::Handle));
    assert!(matches!(
        runtime.validate(&no_handler),
        Err(FlowError::Validation(ValidationError::InvalidStep { .. }))
    ));

    let bad_timeout = Flow::new("timeout").with_timeout("forever").with_step(Step::new("s", "echo"));
    assert!(runtime.validate(&bad_timeout).is_err());

    let empty = Flow::new("empty");
    assert!(matches!(
        runtime.validate(&empty),
        Err(FlowError::Validation(ValidationError::Invalid(_)))
    ));
}

#[test]
fn test_control_flow_shape_checked() {
    let runtime = runtime_with(vec![]);

    let no_body = Flow::new("loop").with_step(Step::new("each", "for_each").with_config("items", json!([1])));
    assert!(runtime.validate(&no_body).is_err());

    let bad_condition = Flow::new("cond").with_step(
        Step::new("decide", "condition")
            .with_config("condition", "a ==")
            .with_then(Step::new("x", "echo")),
    );
    assert!(runtime.validate(&bad_condition).is_err());

    let bad_policy = Flow::new("policy").with_step(
        Step::new("each", "for_each")
            .with_config("items", json!([1]))
            .with_config("failure_policy", "sometimes")
            .with_child(Step::new("x", "echo")),
    );
    assert!(runtime.validate(&bad_policy).is_err());
}

#[test]
fn test_missing_and_cyclic_sub_flows_rejected() {
    let runtime = runtime_with(vec![]);

    let missing = Flow::new("parent").with_step(Step::new("call", "run_flow").with_config("flow", "ghost"));
    assert!(matches!(
        runtime.validate(&missing),
        Err(FlowError::Validation(ValidationError::FlowNotFound(name))) if name == "ghost"
    ));

    runtime.register_flow(Flow::new("a").with_step(Step::new("to_b", "run_flow").with_config("flow", "b")));
    runtime.register_flow(Flow::new("b").with_step(Step::new("to_a", "run_flow").with_config("flow", "a")));
    let a = runtime.library().get("a").unwrap();
    assert!(matches!(
        runtime.validate(&a),
        Err(FlowError::Validation(ValidationError::CyclicFlowReference(_)))
    ));

    let recursive = Flow::new("self").with_step(Step::new("again", "run_flow").with_config("flow", "self"));
    assert!(matches!(
        runtime.validate(&recursive),
        Err(FlowError::Validation(ValidationError::CyclicFlowReference(_)))
    ));
}

#[tokio::test]
async fn test_library_flow_with_unknown_action_fails_parent_before_any_step_runs() {
    let runtime = runtime_with(vec![]);
    runtime.register_flow(Flow::new("lib").with_step(Step::new("bad", "no_such_action")));
    let mut events = runtime.subscribe_events();
    let parent = Flow::new("parent")
        .with_step(Step::new("first", "echo"))
        .with_step(Step::new("call", "run_flow").with_config("flow", "lib"));

    assert!(runtime.validate(&parent).is_err());
    let err = validation_error(runtime.execute(&parent, OutputMap::new()).await);

    match err {
        ValidationError::InvalidSubFlow { flow, source } => {
            assert_eq!(flow, "lib");
            assert!(matches!(*source, ValidationError::UnknownAction { ref action, .. } if action == "no_such_action"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(events.drain().is_empty());
}

#[test]
fn test_library_flow_checked_transitively() {
    let runtime = runtime_with(vec![]);
    runtime.register_flow(
        Flow::new("leaf").with_step(Step::new("slow", "echo").with_timeout("soon")),
    );
    runtime.register_flow(Flow::new("middle").with_step(Step::new("down", "run_flow").with_config("flow", "leaf")));
    let parent = Flow::new("top").with_step(Step::new("call", "run_flow").with_config("flow", "middle"));

    let err = match runtime.validate(&parent) {
        Err(FlowError::Validation(err)) => err,
        other => panic!("expected a validation error, got {:?}", other),
    };
    assert!(matches!(err, ValidationError::InvalidSubFlow { ref flow, .. } if flow == "leaf"), "{}", err);
    assert!(err.to_string().contains("soon"), "{}", err);
}

#[test]
fn test_registry_lists_builtin_actions() {
    let runtime = runtime_with(vec![]);
    let types = runtime.registry().list_action_types();
    for name in [
        "assert",
        "condition",
        "delay",
        "for_each",
        "http_request",
        "log",
        "parallel",
        "run_flow",
        "transform",
        "wait_for",
    ] {
        assert!(types.contains(&name.to_string()), "missing {}", name);
    }
    let metadata = runtime.registry().get_metadata("http_request").unwrap();
    assert!(metadata.config.iter().any(|f| f.name == "url" && f.required));
}
