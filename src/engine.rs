//! The flow execution engine: walks one execution through its flow for one
//! inbound event, bounded by a hard step ceiling, and always returns a
//! definite outcome to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::{EngineError, StoreError};
use crate::evaluator::{Step, evaluate};
use crate::event::{InboundEvent, OutboundEffect};
use crate::flow::Flow;
use crate::flow::state::{ContextPatch, Execution, ExecutionStatus, ExecutionStore, HistoryEntry};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum evaluator steps per inbound event. A cyclic graph that
    /// slipped past validation becomes a recoverable failure instead of an
    /// unbounded synchronous loop.
    pub step_ceiling: usize,
    /// Live executions with no inbound event for this long are swept to
    /// `abandoned` by the session manager.
    pub idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_ceiling: 64,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// What one inbound event produced: the (possibly terminal) status and the
/// ordered effects the caller must dispatch.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub effects: Vec<OutboundEffect>,
}

#[derive(Debug)]
pub struct FlowEngine {
    executions: Arc<dyn ExecutionStore>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(executions: Arc<dyn ExecutionStore>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { executions, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advances `execution` through `flow` for one inbound event.
    ///
    /// The walk loops until a question suspends, a terminal node is
    /// reached, the step ceiling trips, or evaluation fails; every exit
    /// path persists the execution before returning. The caller must hold
    /// the per-(flow, contact) lock for the duration of this call.
    #[tracing::instrument(skip(self, flow, execution, inbound), fields(execution_id = %execution.id, flow_id = %execution.flow_id))]
    pub async fn advance(
        &self,
        flow: &Flow,
        mut execution: Execution,
        inbound: Option<InboundEvent>,
    ) -> Result<EngineOutcome, StoreError> {
        if execution.is_terminal() {
            warn!(
                "event for terminal execution {} ignored (status {:?})",
                execution.id, execution.status
            );
            return Ok(EngineOutcome {
                execution_id: execution.id.clone(),
                status: execution.status.clone(),
                effects: vec![],
            });
        }

        execution.touch();
        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
        }

        if flow.version() != execution.flow_version {
            let error = EngineError::BrokenFlow(format!(
                "flow `{}` changed from version {} to {} mid-execution",
                flow.id(),
                execution.flow_version,
                flow.version()
            ));
            return self.fail(execution, error, vec![]).await;
        }

        let mut effects: Vec<OutboundEffect> = Vec::new();
        let mut inbound = inbound;

        for _step in 0..self.config.step_ceiling {
            let node_id = execution.current_node.clone();
            let Some(node) = flow.node(&node_id) else {
                return self
                    .fail(
                        execution,
                        EngineError::BrokenFlow(format!(
                            "current node `{}` no longer exists in flow `{}`",
                            node_id,
                            flow.id()
                        )),
                        effects,
                    )
                    .await;
            };

            trace!("evaluating node `{}` ({})", node_id, node.kind.type_name());
            let step = evaluate(flow, node, &execution, inbound.as_ref());

            // a question consumes the event whether it accepted the answer,
            // re-prompted, or gave up; no later node may see it again
            if matches!(node.kind, crate::flow::NodeKind::Question { .. }) {
                inbound = None;
            }

            match step {
                Ok(Step::Continue { next, patch, effects: step_effects }) => {
                    execution.apply(patch);
                    execution.current_node = next;
                    effects.extend(step_effects);
                }
                Ok(Step::Suspend { patch, effects: step_effects }) => {
                    execution.apply(patch);
                    effects.extend(step_effects);
                    self.executions.update(&mut execution).await?;
                    return Ok(EngineOutcome {
                        execution_id: execution.id.clone(),
                        status: execution.status.clone(),
                        effects,
                    });
                }
                Ok(Step::Finish { status, patch, effects: step_effects }) => {
                    execution.apply(patch);
                    execution.status = status;
                    effects.extend(step_effects);
                    self.executions.update(&mut execution).await?;
                    return Ok(EngineOutcome {
                        execution_id: execution.id.clone(),
                        status: execution.status.clone(),
                        effects,
                    });
                }
                Err(e) => return self.fail(execution, e, effects).await,
            }
        }

        let ceiling = self.config.step_ceiling;
        self.fail(execution, EngineError::StepCeilingExceeded(ceiling), effects)
            .await
    }

    /// Retires the execution to `Failed{reason}` and persists it. The error
    /// is recorded, never propagated as a panic; the caller still receives
    /// a definite outcome.
    async fn fail(
        &self,
        mut execution: Execution,
        error: EngineError,
        effects: Vec<OutboundEffect>,
    ) -> Result<EngineOutcome, StoreError> {
        warn!("execution {} failed: {}", execution.id, error);
        // record where the walk died so an operator can diagnose from
        // history alone
        execution.apply(
            ContextPatch::new().with_history(HistoryEntry::new(
                execution.current_node.clone(),
                None,
                vec![],
            )),
        );
        execution.fail(error.to_string());
        self.executions.update(&mut execution).await?;
        Ok(EngineOutcome {
            execution_id: execution.id.clone(),
            status: execution.status.clone(),
            effects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::state::InMemoryExecutionStore;
    use crate::flow::{AnswerRule, CompareOp, ConditionRule, Connection, NodeKind};
    use crate::state::StateValue;

    /// start → message("Hi") → question("age?", key=age)
    ///   → condition(age>=18 ? adult : minor) → end
    fn age_flow() -> Flow {
        Flow::new("age_gate", "t1", "Age gate")
            .add_node("start", NodeKind::Start)
            .add_node("hi", NodeKind::Message { text: "Hi".into(), media_url: None })
            .add_node(
                "ask_age",
                NodeKind::Question {
                    text: "age?".into(),
                    save_key: "age".into(),
                    rule: AnswerRule::Number,
                    max_retries: Some(3),
                    retry_text: None,
                },
            )
            .add_node(
                "check",
                NodeKind::Condition {
                    rules: vec![
                        ConditionRule {
                            var: "age".into(),
                            op: CompareOp::Gte,
                            value: Some(StateValue::Number(18.0)),
                            label: "adult".into(),
                        },
                        ConditionRule {
                            var: "age".into(),
                            op: CompareOp::Lt,
                            value: Some(StateValue::Number(18.0)),
                            label: "minor".into(),
                        },
                    ],
                },
            )
            .add_node("adult_end", NodeKind::End)
            .add_node("minor_end", NodeKind::End)
            .add_connection("start", vec![Connection::to("hi")])
            .add_connection("hi", vec![Connection::to("ask_age")])
            .add_connection("ask_age", vec![Connection::to("check")])
            .add_connection(
                "check",
                vec![
                    Connection::labeled("adult", "adult_end"),
                    Connection::labeled("minor", "minor_end"),
                ],
            )
            .build()
    }

    async fn started(
        flow: &Flow,
        store: &Arc<InMemoryExecutionStore>,
    ) -> Execution {
        let exec = Execution::new(flow, "wa:1").unwrap();
        store.insert(&exec).await.unwrap();
        exec
    }

    #[tokio::test]
    async fn test_walk_to_first_question_is_deterministic() {
        let flow = age_flow();
        assert!(flow.validate().is_ok());

        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let exec = started(&flow, &store).await;
        let outcome = engine.advance(&flow, exec, None).await.unwrap();

        // walked start → hi → ask_age, sent "Hi" then the prompt, suspended
        assert_eq!(outcome.status, ExecutionStatus::Running);
        assert_eq!(
            outcome.effects,
            vec![
                OutboundEffect::SendMessage { to: "wa:1".into(), text: "Hi".into() },
                OutboundEffect::SendMessage { to: "wa:1".into(), text: "age?".into() },
            ]
        );

        let persisted = store.get(&outcome.execution_id).await.unwrap();
        assert_eq!(persisted.current_node, "ask_age");
        assert_eq!(persisted.awaiting.as_ref().unwrap().node_id, "ask_age");
    }

    #[tokio::test]
    async fn test_scenario_a_adult_route() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let exec = started(&flow, &store).await;
        let outcome = engine.advance(&flow, exec, None).await.unwrap();
        let exec = store.get(&outcome.execution_id).await.unwrap();

        let outcome = engine
            .advance(&flow, exec, Some(InboundEvent::text("wa:1", "25")))
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed { reason: "end_reached".into() });
        let done = store.get(&outcome.execution_id).await.unwrap();
        assert_eq!(done.current_node, "adult_end");
        assert_eq!(done.variables.get("age"), Some(&StateValue::String("25".into())));
        assert!(done.awaiting.is_none());
    }

    #[tokio::test]
    async fn test_scenario_b_invalid_answer_reprompts() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let exec = started(&flow, &store).await;
        let outcome = engine.advance(&flow, exec, None).await.unwrap();
        let exec = store.get(&outcome.execution_id).await.unwrap();

        let outcome = engine
            .advance(&flow, exec, Some(InboundEvent::text("wa:1", "abc")))
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Running);
        assert_eq!(
            outcome.effects,
            vec![OutboundEffect::SendMessage { to: "wa:1".into(), text: "age?".into() }]
        );
        let suspended = store.get(&outcome.execution_id).await.unwrap();
        assert_eq!(suspended.current_node, "ask_age");
        assert_eq!(suspended.awaiting.as_ref().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_scenario_c_retries_exhausted_hands_off() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let exec = started(&flow, &store).await;
        let mut outcome = engine.advance(&flow, exec, None).await.unwrap();

        for _ in 0..3 {
            let exec = store.get(&outcome.execution_id).await.unwrap();
            outcome = engine
                .advance(&flow, exec, Some(InboundEvent::text("wa:1", "not a number")))
                .await
                .unwrap();
        }

        assert_eq!(
            outcome.status,
            ExecutionStatus::Completed { reason: "max_retries_exceeded".into() }
        );
        assert!(matches!(
            outcome.effects.last(),
            Some(OutboundEffect::TransferToHuman { .. })
        ));
    }

    #[tokio::test]
    async fn test_scenario_d_unmatched_condition_fails() {
        // same shape but the condition covers only the adult case and has
        // no default
        let flow = Flow::new("gate", "t1", "gate")
            .add_node("start", NodeKind::Start)
            .add_node(
                "check",
                NodeKind::Condition {
                    rules: vec![ConditionRule {
                        var: "age".into(),
                        op: CompareOp::Gte,
                        value: Some(StateValue::Number(18.0)),
                        label: "adult".into(),
                    }],
                },
            )
            .add_node("adult_end", NodeKind::End)
            .add_connection("start", vec![Connection::to("check")])
            .add_connection("check", vec![Connection::labeled("adult", "adult_end")])
            .with_variable("age", StateValue::String("12".into()))
            .build();

        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let exec = started(&flow, &store).await;
        let outcome = engine.advance(&flow, exec, None).await.unwrap();

        match &outcome.status {
            ExecutionStatus::Failed { reason } => {
                assert!(reason.contains("no default connection"), "reason: {reason}");
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        // history records the walk up to and including the failing node
        let failed = store.get(&outcome.execution_id).await.unwrap();
        let visited: Vec<&str> = failed.history.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(visited, vec!["start", "check"]);
    }

    #[tokio::test]
    async fn test_step_ceiling_on_cyclic_graph() {
        // two messages pointing at each other; deliberately registered
        // without validation
        let flow = Flow::new("loop", "t1", "loop")
            .add_node("start", NodeKind::Start)
            .add_node("a", NodeKind::Message { text: "a".into(), media_url: None })
            .add_node("b", NodeKind::Message { text: "b".into(), media_url: None })
            .add_connection("start", vec![Connection::to("a")])
            .add_connection("a", vec![Connection::to("b")])
            .add_connection("b", vec![Connection::to("a")])
            .build();

        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(
            store.clone(),
            EngineConfig { step_ceiling: 10, ..Default::default() },
        );

        let exec = started(&flow, &store).await;
        let outcome = engine.advance(&flow, exec, None).await.unwrap();

        match &outcome.status {
            ExecutionStatus::Failed { reason } => {
                assert!(reason.contains("step ceiling"), "reason: {reason}");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broken_flow_when_node_deleted() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let mut exec = started(&flow, &store).await;
        exec.current_node = "deleted_node".into();
        store.update(&mut exec).await.unwrap();

        let outcome = engine.advance(&flow, exec, None).await.unwrap();
        match &outcome.status {
            ExecutionStatus::Failed { reason } => {
                assert!(reason.contains("no longer exists"), "reason: {reason}");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flow_version_mismatch_fails_safely() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let mut exec = started(&flow, &store).await;
        exec.flow_version = 99;
        store.update(&mut exec).await.unwrap();

        let outcome = engine.advance(&flow, exec, None).await.unwrap();
        match &outcome.status {
            ExecutionStatus::Failed { reason } => {
                assert!(reason.contains("mid-execution"), "reason: {reason}");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_execution_ignores_events() {
        let flow = age_flow();
        let store = InMemoryExecutionStore::new();
        let engine = FlowEngine::new(store.clone(), EngineConfig::default());

        let mut exec = started(&flow, &store).await;
        exec.complete("end_reached");
        store.update(&mut exec).await.unwrap();

        let outcome = engine
            .advance(&flow, exec, Some(InboundEvent::text("wa:1", "hello?")))
            .await
            .unwrap();
        assert!(outcome.effects.is_empty());
        assert!(outcome.status.is_terminal());
    }
}
