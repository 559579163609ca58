//! In-memory flow registry with JSON/YAML file loading.
//!
//! Validation runs when a flow is registered, not during traversal; the
//! engine trusts registered definitions but still fails gracefully on a
//! node deleted after validation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info};

use crate::error::FlowError;
use crate::flow::Flow;

#[derive(Debug, Default)]
pub struct FlowStore {
    flows: DashMap<String, Flow>,
}

impl FlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds, validates and registers a flow. Replacing a flow id requires
    /// a bumped `version`: running executions pin the version they started
    /// against, and an in-place edit under the same version would slip past
    /// that check. Re-registering an identical definition is a no-op.
    pub fn register(&self, flow: Flow) -> Result<(), FlowError> {
        let flow = flow.build();
        flow.validate()?;
        let id = flow.id().to_string();
        if let Some(existing) = self.flows.get(&id) {
            if existing.version() == flow.version() && *existing != flow {
                return Err(FlowError::Validation(format!(
                    "flow `{}` version {} is already registered with a different definition; bump `version` to replace it",
                    id,
                    flow.version()
                )));
            }
        }
        self.flows.insert(id.clone(), flow);
        info!("Registered flow: {}", id);
        Ok(())
    }

    pub fn get(&self, flow_id: &str) -> Result<Flow, FlowError> {
        self.flows
            .get(flow_id)
            .map(|f| f.clone())
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))
    }

    pub fn remove(&self, flow_id: &str) {
        self.flows.remove(flow_id);
        info!("Removed flow: {}", flow_id);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Parses a flow file by extension: `.json`, or `.yaml`/`.yml`.
    pub fn load_flow_from_file(path: &Path) -> Result<Flow, FlowError> {
        let contents =
            fs::read_to_string(path).map_err(|e| FlowError::Io(format!("read error: {}", e)))?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let flow: Flow = match ext.as_str() {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("JSON parse error: {}", e)))?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents)
                .map_err(|e| FlowError::Serialization(format!("YAML parse error: {}", e)))?,
            other => {
                return Err(FlowError::Serialization(format!(
                    "unsupported extension `{}` (expected .json, .yaml or .yml)",
                    other
                )));
            }
        };

        Ok(flow.build())
    }

    pub fn save_flow_to_file(path: &Path, flow: &Flow) -> Result<(), FlowError> {
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let contents = match ext.as_str() {
            "json" => serde_json::to_string_pretty(flow)
                .map_err(|e| FlowError::Serialization(format!("{}", e)))?,
            "yaml" | "yml" => serde_yaml_bw::to_string(flow)
                .map_err(|e| FlowError::Serialization(format!("{}", e)))?,
            other => {
                return Err(FlowError::Serialization(format!(
                    "unsupported extension `{}` (expected .json, .yaml or .yml)",
                    other
                )));
            }
        };

        fs::write(path, contents).map_err(|e| FlowError::Io(format!("{}", e)))?;
        Ok(())
    }

    /// Loads every flow file in a directory, skipping ones that fail to
    /// parse or validate. Returns how many registered.
    pub fn load_all_from_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !matches!(ext, "json" | "yaml" | "yml") {
                continue;
            }
            match Self::load_flow_from_file(&path) {
                Ok(flow) => match self.register(flow) {
                    Ok(()) => count += 1,
                    Err(e) => error!("Failed to register {}: {}", path.display(), e),
                },
                Err(e) => error!("Failed to load {}: {}", path.display(), e),
            }
        }
        Ok(count)
    }
}
