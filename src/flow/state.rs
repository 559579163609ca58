//! Resumable execution state: one record per (flow, contact) run, with an
//! append-only history and an explicit optimistic version token.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::OutboundEffect;
use crate::flow::Flow;
use crate::state::StateValue;

/// Lifecycle of one execution. `Abandoned` is reached only through the
/// session manager (idle sweep or administrative cancel), never through
/// node evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed { reason: String },
    Failed { reason: String },
    Abandoned { reason: String },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed { .. }
                | ExecutionStatus::Failed { .. }
                | ExecutionStatus::Abandoned { .. }
        )
    }

    /// The stored terminal reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ExecutionStatus::Completed { reason }
            | ExecutionStatus::Failed { reason }
            | ExecutionStatus::Abandoned { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Question-suspension bookkeeping: which node awaits an answer and how
/// many invalid attempts it has seen.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Awaiting {
    pub node_id: String,
    pub attempts: u32,
}

/// One record per evaluated node, appended in walk order and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HistoryEntry {
    pub node_id: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<OutboundEffect>,
}

impl HistoryEntry {
    pub fn new(node_id: impl Into<String>, input: Option<Value>, effects: Vec<OutboundEffect>) -> Self {
        Self { node_id: node_id.into(), at: Utc::now(), input, effects }
    }
}

/// How a [`ContextPatch`] changes the awaiting slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AwaitingPatch {
    #[default]
    Keep,
    Set(Awaiting),
    Clear,
}

/// The evaluator's output against the execution context: variable merges,
/// history appends and the awaiting transition. Applying a patch is the only
/// way node evaluation mutates an execution.
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub vars: HashMap<String, StateValue>,
    pub awaiting: AwaitingPatch,
    pub history: Vec<HistoryEntry>,
}

impl ContextPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: StateValue) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn with_history(mut self, entry: HistoryEntry) -> Self {
        self.history.push(entry);
        self
    }

    pub fn set_awaiting(mut self, awaiting: Awaiting) -> Self {
        self.awaiting = AwaitingPatch::Set(awaiting);
        self
    }

    pub fn clear_awaiting(mut self) -> Self {
        self.awaiting = AwaitingPatch::Clear;
        self
    }
}

/// One run of a flow for one contact.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    /// Definition version pinned at creation; a mid-run flow edit is
    /// detected by comparing this against the loaded flow.
    pub flow_version: u32,
    pub contact_id: String,
    pub current_node: String,
    pub status: ExecutionStatus,
    pub variables: HashMap<String, StateValue>,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<Awaiting>,
    /// Optimistic concurrency token, checked and incremented on every store
    /// update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh `Pending` execution positioned at the flow's start node,
    /// seeded with the flow's default variables.
    pub fn new(flow: &Flow, contact_id: impl Into<String>) -> Result<Self, crate::error::FlowError> {
        let start = flow.start_node_id()?.to_string();
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow.id().to_string(),
            flow_version: flow.version(),
            contact_id: contact_id.into(),
            current_node: start,
            status: ExecutionStatus::Pending,
            variables: flow.variables().clone(),
            history: Vec::new(),
            awaiting: None,
            version: 0,
            created_at: now,
            last_event_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a patch: variables overwrite, history appends, awaiting
    /// transitions. History is never truncated or rewritten.
    pub fn apply(&mut self, patch: ContextPatch) {
        for (k, v) in patch.vars {
            self.variables.insert(k, v);
        }
        match patch.awaiting {
            AwaitingPatch::Keep => {}
            AwaitingPatch::Set(a) => self.awaiting = Some(a),
            AwaitingPatch::Clear => self.awaiting = None,
        }
        self.history.extend(patch.history);
    }

    /// Serializable form for persistence and operator inspection.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn complete(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Completed { reason: reason.into() };
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Failed { reason: reason.into() };
    }

    pub fn abandon(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Abandoned { reason: reason.into() };
    }

    pub fn touch(&mut self) {
        self.last_event_at = Utc::now();
    }
}

/// Exclusivity key for one (flow, contact) pair.
pub fn live_key(flow_id: &str, contact_id: &str) -> String {
    format!("{flow_id}|{contact_id}")
}

/// Durable home of execution records. `update` must check-and-increment the
/// optimistic version token; everything else is plain record access.
#[async_trait]
pub trait ExecutionStore: Send + Sync + Debug {
    async fn get(&self, execution_id: &str) -> Option<Execution>;

    /// The live (non-terminal) execution for a (flow, contact) pair, if any.
    async fn find_live(&self, flow_id: &str, contact_id: &str) -> Option<Execution>;

    /// Inserts a new execution. Fails with `DuplicateLive` when the pair
    /// already has a live one.
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Persists a mutated execution. The caller's `version` must match the
    /// stored one; on success both are incremented. Terminal executions are
    /// released from the live index.
    async fn update(&self, execution: &mut Execution) -> Result<(), StoreError>;

    async fn list_live(&self) -> Vec<Execution>;
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: DashMap<String, Execution>,
    live: DashMap<String, String>, // live_key → execution id
}

impl InMemoryExecutionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    async fn find_live(&self, flow_id: &str, contact_id: &str) -> Option<Execution> {
        let id = self.live.get(&live_key(flow_id, contact_id))?.clone();
        self.executions.get(&id).map(|e| e.clone())
    }

    async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
        if !execution.is_terminal() {
            // entry keeps the claim atomic for callers racing on the same pair
            let key = live_key(&execution.flow_id, &execution.contact_id);
            match self.live.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(StoreError::DuplicateLive);
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(execution.id.clone());
                }
            }
        }
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &mut Execution) -> Result<(), StoreError> {
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound)?;
        if stored.version != execution.version {
            return Err(StoreError::VersionConflict {
                expected: execution.version,
                found: stored.version,
            });
        }
        execution.version += 1;
        *stored = execution.clone();
        drop(stored);

        if execution.is_terminal() {
            let key = live_key(&execution.flow_id, &execution.contact_id);
            // only release the slot if this execution still owns it
            if let Some(owner) = self.live.get(&key).map(|e| e.clone()) {
                if owner == execution.id {
                    self.live.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn list_live(&self) -> Vec<Execution> {
        self.live
            .iter()
            .filter_map(|entry| self.executions.get(entry.value()).map(|e| e.clone()))
            .collect()
    }
}
