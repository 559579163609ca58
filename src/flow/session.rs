//! Session management: at most one live execution per (flow, contact) pair.
//!
//! Every mutation of an execution happens under that pair's async lock, so
//! two near-simultaneous inbound messages for the same contact serialize
//! instead of diverging on the same context. Inbound events are assumed to
//! arrive in receipt order (FIFO per key is the transport's job).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{EngineOutcome, FlowEngine};
use crate::error::SessionError;
use crate::event::InboundEvent;
use crate::flow::state::{Execution, ExecutionStore, live_key};
use crate::flow::store::FlowStore;

/// How long an unused per-key lock stays cached before it ages out.
const LOCK_TTL_SECS: u64 = 24 * 60 * 60;

pub struct SessionManager {
    flows: Arc<FlowStore>,
    engine: Arc<FlowEngine>,
    store: Arc<dyn ExecutionStore>,
    /// Per-(flow, contact) serialization locks. Idle entries age out; a
    /// re-created lock is still correct because the store stays
    /// authoritative for what is live.
    locks: Cache<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        flows: Arc<FlowStore>,
        engine: Arc<FlowEngine>,
        store: Arc<dyn ExecutionStore>,
    ) -> Arc<Self> {
        let locks = Cache::builder()
            .time_to_idle(Duration::from_secs(LOCK_TTL_SECS))
            .build();
        Arc::new(Self { flows, engine, store, locks })
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(async { Arc::new(Mutex::new(())) })
            .await
            .into_value()
    }

    /// Routes one inbound event: resumes the live execution for
    /// (flow, contact) if one exists, otherwise starts a new one when a
    /// flow trigger matches. Returns `Ok(None)` when nothing applies.
    #[tracing::instrument(skip(self, event), fields(contact_id = %event.contact_id))]
    pub async fn handle_event(
        &self,
        flow_id: &str,
        event: InboundEvent,
    ) -> Result<Option<EngineOutcome>, SessionError> {
        let flow = self
            .flows
            .get(flow_id)
            .map_err(|_| SessionError::FlowNotFound(flow_id.to_string()))?;
        if !flow.is_active() {
            debug!("flow `{}` is inactive, ignoring event", flow_id);
            return Ok(None);
        }

        let key = live_key(flow_id, &event.contact_id);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let execution = match self.store.find_live(flow_id, &event.contact_id).await {
            Some(existing) => existing,
            None => {
                if !flow.triggers().iter().any(|t| t.matches(&event)) {
                    debug!("no live execution and no trigger matched for `{}`", key);
                    return Ok(None);
                }
                let fresh = Execution::new(&flow, &event.contact_id)
                    .map_err(|e| SessionError::Conflict(e.to_string()))?;
                self.store.insert(&fresh).await?;
                info!("started execution {} for `{}`", fresh.id, key);
                fresh
            }
        };

        let outcome = self.engine.advance(&flow, execution, Some(event)).await?;
        Ok(Some(outcome))
    }

    /// Moves every live execution idle past the engine's timeout to
    /// `abandoned`, releasing its exclusivity slot. Returns how many were
    /// swept.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = chrono::Duration::from_std(self.engine.config().idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));
        let now = Utc::now();
        let mut swept = 0;

        for candidate in self.store.list_live().await {
            if now - candidate.last_event_at <= timeout {
                continue;
            }
            let key = live_key(&candidate.flow_id, &candidate.contact_id);
            let lock = self.key_lock(&key).await;
            let _guard = lock.lock().await;

            // re-read under the lock: an event may have just arrived
            let Some(mut current) = self
                .store
                .find_live(&candidate.flow_id, &candidate.contact_id)
                .await
            else {
                continue;
            };
            if current.id != candidate.id || now - current.last_event_at <= timeout {
                continue;
            }

            current.abandon("idle_timeout");
            match self.store.update(&mut current).await {
                Ok(()) => {
                    info!("abandoned idle execution {} for `{}`", current.id, key);
                    swept += 1;
                }
                Err(e) => warn!("idle sweep skipped {}: {}", current.id, e),
            }
        }
        swept
    }

    /// Administrative force-terminate of the live execution for a pair.
    /// Safe to call concurrently with `handle_event`; both take the same
    /// key lock. Returns whether an execution was cancelled.
    pub async fn cancel(
        &self,
        flow_id: &str,
        contact_id: &str,
        reason: impl Into<String>,
    ) -> Result<bool, SessionError> {
        let key = live_key(flow_id, contact_id);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let Some(mut execution) = self.store.find_live(flow_id, contact_id).await else {
            return Ok(false);
        };
        execution.abandon(reason.into());
        self.store.update(&mut execution).await?;
        info!("cancelled execution {} for `{}`", execution.id, key);
        Ok(true)
    }
}
