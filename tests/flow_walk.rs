//! End-to-end walk through the public API: author a flow as YAML, load it
//! through the store, and drive a full conversation through the session
//! manager.

use std::fs;
use std::sync::Arc;

use aura_flow::{
    EngineConfig, ExecutionStatus, ExecutionStore, FlowEngine, FlowStore, InMemoryExecutionStore,
    InboundEvent, OutboundEffect, SessionManager, StateValue,
};
use tempfile::tempdir;

const AGE_GATE_YAML: &str = r#"
id: age_gate
tenant_id: acme
name: Age gate
nodes:
  start:
    type: start
  hi:
    type: message
    text: "Hi! Welcome to {{brand}}."
  ask_age:
    type: question
    text: "How old are you?"
    save_key: age
    rule:
      kind: number
    max_retries: 3
    retry_text: "Numbers only, please."
  check:
    type: condition
    rules:
      - var: age
        op: gte
        value: 18
        label: adult
      - var: age
        op: lt
        value: 18
        label: minor
  adult_msg:
    type: message
    text: "Great, you're all set."
  minor_msg:
    type: transfer_to_human
    note: "minor, needs guardian consent"
  done:
    type: end
connections:
  start:
    - to: hi
  hi:
    - to: ask_age
  ask_age:
    - to: check
  check:
    - label: adult
      to: adult_msg
    - label: minor
      to: minor_msg
  adult_msg:
    - to: done
triggers:
  - kind: keyword
    keywords: ["hello", "hi"]
variables:
  brand: "Acme"
"#;

fn setup() -> (Arc<SessionManager>, Arc<InMemoryExecutionStore>) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("age_gate.yaml");
    fs::write(&path, AGE_GATE_YAML).unwrap();

    let flows = FlowStore::new();
    let loaded = flows.load_all_from_dir(dir.path()).unwrap();
    assert_eq!(loaded, 1);

    let store = InMemoryExecutionStore::new();
    let engine = FlowEngine::new(store.clone(), EngineConfig::default());
    (SessionManager::new(flows, engine, store.clone()), store)
}

#[tokio::test]
async fn adult_conversation_runs_to_end() {
    let (mgr, store) = setup();

    let first = mgr
        .handle_event("age_gate", InboundEvent::text("wa:555", "hello"))
        .await
        .unwrap()
        .expect("keyword trigger starts the flow");

    assert_eq!(first.status, ExecutionStatus::Running);
    assert_eq!(
        first.effects,
        vec![
            OutboundEffect::SendMessage {
                to: "wa:555".into(),
                text: "Hi! Welcome to Acme.".into()
            },
            OutboundEffect::SendMessage { to: "wa:555".into(), text: "How old are you?".into() },
        ]
    );

    let second = mgr
        .handle_event("age_gate", InboundEvent::text("wa:555", "25"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(second.status, ExecutionStatus::Completed { reason: "end_reached".into() });
    assert_eq!(
        second.effects,
        vec![OutboundEffect::SendMessage {
            to: "wa:555".into(),
            text: "Great, you're all set.".into()
        }]
    );

    let exec = store.get(&second.execution_id).await.unwrap();
    assert_eq!(exec.variables.get("age"), Some(&StateValue::String("25".into())));
    let visited: Vec<&str> = exec.history.iter().map(|h| h.node_id.as_str()).collect();
    assert_eq!(visited, vec!["start", "hi", "ask_age", "ask_age", "check", "adult_msg", "done"]);
}

#[tokio::test]
async fn minor_conversation_hands_off() {
    let (mgr, _store) = setup();

    mgr.handle_event("age_gate", InboundEvent::text("wa:777", "hi"))
        .await
        .unwrap()
        .unwrap();

    let outcome = mgr
        .handle_event("age_gate", InboundEvent::text("wa:777", "15"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        outcome.status,
        ExecutionStatus::Completed { reason: "transferred_to_human".into() }
    );
    assert_eq!(
        outcome.effects,
        vec![OutboundEffect::TransferToHuman {
            to: "wa:777".into(),
            note: Some("minor, needs guardian consent".into())
        }]
    );
}

#[tokio::test]
async fn invalid_answers_reprompt_then_hand_off() {
    let (mgr, _store) = setup();

    mgr.handle_event("age_gate", InboundEvent::text("wa:888", "hello"))
        .await
        .unwrap()
        .unwrap();

    let mut last = None;
    for _ in 0..3 {
        last = mgr
            .handle_event("age_gate", InboundEvent::text("wa:888", "twenty"))
            .await
            .unwrap();
    }

    let outcome = last.unwrap();
    assert_eq!(
        outcome.status,
        ExecutionStatus::Completed { reason: "max_retries_exceeded".into() }
    );
    assert!(matches!(
        outcome.effects.last(),
        Some(OutboundEffect::TransferToHuman { .. })
    ));

    // slot is free again: the next keyword starts a fresh execution
    let fresh = mgr
        .handle_event("age_gate", InboundEvent::text("wa:888", "hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.status, ExecutionStatus::Running);
}
