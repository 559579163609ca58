//! Pure per-node evaluation: given a node, the execution context and an
//! optional inbound event, decide the next transition. No I/O, no store
//! access; the engine owns persistence and effect dispatch.

use std::collections::HashMap;

use handlebars::Handlebars;
use regex::Regex;

use crate::error::EngineError;
use crate::event::{InboundEvent, OutboundEffect};
use crate::flow::{AnswerRule, CompareOp, ConditionRule, Connection, Flow, NodeConfig, NodeKind};
use crate::flow::state::{Awaiting, ContextPatch, Execution, ExecutionStatus, HistoryEntry};
use crate::state::{StateValue, vars_to_json};

/// Retry budget for a question node when its config leaves `max_retries`
/// unset.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Outcome of evaluating one node.
#[derive(Debug, Clone)]
pub enum Step {
    /// Move to `next` and keep walking within the same inbound event.
    Continue {
        next: String,
        patch: ContextPatch,
        effects: Vec<OutboundEffect>,
    },
    /// A question awaits its answer: persist and yield to the caller.
    Suspend {
        patch: ContextPatch,
        effects: Vec<OutboundEffect>,
    },
    /// The walk ends here with a terminal status.
    Finish {
        status: ExecutionStatus,
        patch: ContextPatch,
        effects: Vec<OutboundEffect>,
    },
}

/// Renders a handlebars template against the execution variables. A broken
/// template is a definition fault, not a contact-visible error.
fn render_text(
    template: &str,
    vars: &HashMap<String, StateValue>,
) -> Result<String, EngineError> {
    let hb = Handlebars::new();
    hb.render_template(template, &vars_to_json(vars))
        .map_err(|e| EngineError::BrokenFlow(format!("template render failed: {}", e)))
}

/// The single outbound target of a start/message/question node. Validation
/// enforces exactly one; a runtime mismatch means the definition changed
/// under us.
fn single_target(flow: &Flow, node: &NodeConfig) -> Result<String, EngineError> {
    let conns = flow.connections_from(&node.id);
    match conns {
        [only] => Ok(only.to.clone()),
        _ => Err(EngineError::BrokenFlow(format!(
            "{} node `{}` has {} outbound connections, expected exactly one",
            node.kind.type_name(),
            node.id,
            conns.len()
        ))),
    }
}

impl AnswerRule {
    /// Whether `answer` satisfies this rule. A non-compiling regex pattern
    /// is reported as a broken flow rather than an invalid answer.
    pub fn accepts(&self, answer: &str) -> Result<bool, EngineError> {
        match self {
            AnswerRule::Any => Ok(!answer.trim().is_empty()),
            AnswerRule::Number => Ok(answer.trim().parse::<f64>().is_ok()),
            AnswerRule::Regex { pattern } => {
                let re = Regex::new(pattern).map_err(|e| {
                    EngineError::BrokenFlow(format!("invalid answer pattern `{}`: {}", pattern, e))
                })?;
                Ok(re.is_match(answer.trim()))
            }
            AnswerRule::OneOf { options, case_insensitive } => {
                let answer = answer.trim();
                Ok(options.iter().any(|o| {
                    if *case_insensitive {
                        o.eq_ignore_ascii_case(answer)
                    } else {
                        o == answer
                    }
                }))
            }
        }
    }
}

impl ConditionRule {
    /// Whether this rule's predicate holds over the variables. A missing
    /// variable never matches (except through `exists`, which it fails);
    /// a present value that cannot be coerced for a numeric comparison is
    /// a predicate error.
    pub fn holds(&self, vars: &HashMap<String, StateValue>) -> Result<bool, EngineError> {
        let current = vars.get(&self.var);

        if matches!(self.op, CompareOp::Exists) {
            return Ok(current.is_some_and(|v| !matches!(v, StateValue::Null)));
        }

        let Some(current) = current else {
            return Ok(false);
        };
        let expected = self.value.as_ref().ok_or_else(|| {
            EngineError::Predicate(format!(
                "rule on `{}` uses `{:?}` but declares no comparison value",
                self.var, self.op
            ))
        })?;

        match self.op {
            CompareOp::Eq => Ok(compare_eq(current, expected)),
            CompareOp::Neq => Ok(!compare_eq(current, expected)),
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
                let lhs = current.coerce_number().ok_or_else(|| {
                    EngineError::Predicate(format!(
                        "variable `{}` value `{}` is not numeric",
                        self.var,
                        current.display()
                    ))
                })?;
                let rhs = expected.coerce_number().ok_or_else(|| {
                    EngineError::Predicate(format!(
                        "rule on `{}` compares against non-numeric `{}`",
                        self.var,
                        expected.display()
                    ))
                })?;
                Ok(match self.op {
                    CompareOp::Gt => lhs > rhs,
                    CompareOp::Gte => lhs >= rhs,
                    CompareOp::Lt => lhs < rhs,
                    CompareOp::Lte => lhs <= rhs,
                    _ => unreachable!(),
                })
            }
            CompareOp::Contains => match current {
                StateValue::String(s) => Ok(s.contains(&expected.display())),
                StateValue::List(l) => Ok(l.contains(expected)),
                _ => Ok(false),
            },
            CompareOp::Exists => unreachable!(),
        }
    }
}

// Equality is number-aware: "25" == 25. Everything else falls back to the
// string view.
fn compare_eq(a: &StateValue, b: &StateValue) -> bool {
    if let (Some(x), Some(y)) = (a.coerce_number(), b.coerce_number()) {
        return x == y;
    }
    a.display() == b.display()
}

/// Chooses the connection a condition node routes through: first matching
/// rule's label in declaration order, else the unlabeled default.
fn route_condition<'a>(
    node: &NodeConfig,
    rules: &[ConditionRule],
    conns: &'a [Connection],
    vars: &HashMap<String, StateValue>,
) -> Result<&'a Connection, EngineError> {
    for rule in rules {
        if rule.holds(vars)? {
            return conns
                .iter()
                .find(|c| c.label.as_deref() == Some(rule.label.as_str()))
                .ok_or_else(|| {
                    EngineError::BrokenFlow(format!(
                        "condition node `{}` matched label `{}` but has no such connection",
                        node.id, rule.label
                    ))
                });
        }
    }
    conns
        .iter()
        .find(|c| c.label.is_none())
        .ok_or_else(|| {
            EngineError::Predicate(format!(
                "condition node `{}` matched no rule and declares no default connection",
                node.id
            ))
        })
}

/// Evaluates one node. The inbound event is only consumed by a question
/// node that is currently awaiting its answer; every other type transitions
/// without it.
pub fn evaluate(
    flow: &Flow,
    node: &NodeConfig,
    execution: &Execution,
    inbound: Option<&InboundEvent>,
) -> Result<Step, EngineError> {
    match &node.kind {
        NodeKind::Start => Ok(Step::Continue {
            next: single_target(flow, node)?,
            patch: ContextPatch::new().with_history(HistoryEntry::new(&node.id, None, vec![])),
            effects: vec![],
        }),

        NodeKind::Message { text, media_url } => {
            let rendered = render_text(text, &execution.variables)?;
            let effect = match media_url {
                Some(url) => OutboundEffect::SendMedia {
                    to: execution.contact_id.clone(),
                    url: url.clone(),
                    caption: Some(rendered),
                },
                None => OutboundEffect::SendMessage {
                    to: execution.contact_id.clone(),
                    text: rendered,
                },
            };
            Ok(Step::Continue {
                next: single_target(flow, node)?,
                patch: ContextPatch::new().with_history(HistoryEntry::new(
                    &node.id,
                    None,
                    vec![effect.clone()],
                )),
                effects: vec![effect],
            })
        }

        NodeKind::Question { text, save_key, rule, max_retries, retry_text } => {
            let awaiting_here = execution
                .awaiting
                .as_ref()
                .filter(|a| a.node_id == node.id);

            let Some(awaiting) = awaiting_here else {
                // first visit: prompt and hold for the next inbound event
                let prompt = render_text(text, &execution.variables)?;
                let effect = OutboundEffect::SendMessage {
                    to: execution.contact_id.clone(),
                    text: prompt,
                };
                return Ok(Step::Suspend {
                    patch: ContextPatch::new()
                        .set_awaiting(Awaiting { node_id: node.id.clone(), attempts: 0 })
                        .with_history(HistoryEntry::new(&node.id, None, vec![effect.clone()])),
                    effects: vec![effect],
                });
            };

            let Some(event) = inbound else {
                // woken without an event; keep holding
                return Ok(Step::Suspend {
                    patch: ContextPatch::new(),
                    effects: vec![],
                });
            };

            let answer = event.body();
            if rule.accepts(&answer)? {
                return Ok(Step::Continue {
                    next: single_target(flow, node)?,
                    patch: ContextPatch::new()
                        .with_var(save_key.clone(), StateValue::String(answer.trim().to_string()))
                        .clear_awaiting()
                        .with_history(HistoryEntry::new(
                            &node.id,
                            Some(event.payload.clone()),
                            vec![],
                        )),
                    effects: vec![],
                });
            }

            let attempts = awaiting.attempts + 1;
            let budget = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
            if attempts >= budget {
                // retries exhausted: hand the conversation to a human
                let effect = OutboundEffect::TransferToHuman {
                    to: execution.contact_id.clone(),
                    note: Some(format!(
                        "question `{}` unanswered after {} attempts",
                        node.id, attempts
                    )),
                };
                return Ok(Step::Finish {
                    status: ExecutionStatus::Completed { reason: "max_retries_exceeded".into() },
                    patch: ContextPatch::new()
                        .clear_awaiting()
                        .with_history(HistoryEntry::new(
                            &node.id,
                            Some(event.payload.clone()),
                            vec![effect.clone()],
                        )),
                    effects: vec![effect],
                });
            }

            let reprompt = render_text(
                retry_text.as_deref().unwrap_or(text.as_str()),
                &execution.variables,
            )?;
            let effect = OutboundEffect::SendMessage {
                to: execution.contact_id.clone(),
                text: reprompt,
            };
            Ok(Step::Suspend {
                patch: ContextPatch::new()
                    .set_awaiting(Awaiting { node_id: node.id.clone(), attempts })
                    .with_history(HistoryEntry::new(
                        &node.id,
                        Some(event.payload.clone()),
                        vec![effect.clone()],
                    )),
                effects: vec![effect],
            })
        }

        NodeKind::Condition { rules } => {
            let conns = flow.connections_from(&node.id);
            let chosen = route_condition(node, rules, conns, &execution.variables)?;
            Ok(Step::Continue {
                next: chosen.to.clone(),
                patch: ContextPatch::new().with_history(HistoryEntry::new(&node.id, None, vec![])),
                effects: vec![],
            })
        }

        NodeKind::TransferToHuman { note } => {
            let effect = OutboundEffect::TransferToHuman {
                to: execution.contact_id.clone(),
                note: note.clone(),
            };
            Ok(Step::Finish {
                status: ExecutionStatus::Completed { reason: "transferred_to_human".into() },
                patch: ContextPatch::new().with_history(HistoryEntry::new(
                    &node.id,
                    None,
                    vec![effect.clone()],
                )),
                effects: vec![effect],
            })
        }

        NodeKind::End => Ok(Step::Finish {
            status: ExecutionStatus::Completed { reason: "end_reached".into() },
            patch: ContextPatch::new().with_history(HistoryEntry::new(&node.id, None, vec![])),
            effects: vec![],
        }),
    }
}
