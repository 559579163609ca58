//! Aura flow execution engine.
//!
//! Models a conversational automation as a directed graph of typed nodes
//! (start, message, question, condition, transfer-to-human, end), walks one
//! contact's conversation through that graph message by message, and
//! persists resumable execution state between inbound events.
//!
//! The typical host wires four pieces together:
//!
//! - a [`flow::store::FlowStore`] holding validated [`flow::Flow`]
//!   definitions,
//! - an [`flow::state::ExecutionStore`] for execution records (an
//!   in-memory one is provided),
//! - a [`engine::FlowEngine`] that advances executions, and
//! - a [`flow::session::SessionManager`] that serializes events per
//!   (flow, contact) pair and owns trigger matching, idle sweeping and
//!   administrative cancels.
//!
//! Inbound webhook events enter through
//! [`flow::session::SessionManager::handle_event`]; the returned
//! [`engine::EngineOutcome`] carries the ordered
//! [`event::OutboundEffect`]s the host must dispatch to its messaging
//! provider.

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod flow;
pub mod logger;
pub mod state;

pub use engine::{EngineConfig, EngineOutcome, FlowEngine};
pub use error::{EngineError, FlowError, SessionError, StoreError};
pub use event::{InboundEvent, OutboundEffect};
pub use flow::session::SessionManager;
pub use flow::state::{Execution, ExecutionStatus, ExecutionStore, InMemoryExecutionStore};
pub use flow::store::FlowStore;
pub use flow::{AnswerRule, CompareOp, ConditionRule, Connection, Flow, NodeConfig, NodeKind, Trigger};
pub use state::StateValue;
