//! Flow definitions: a directed graph of typed nodes walked one contact
//! conversation at a time.
//!
//! A `Flow` is authored as JSON or YAML, built into a petgraph for save-time
//! validation, and never mutated mid-execution: running executions pin the
//! `version` they started against.

pub mod session;
pub mod state;
pub mod store;

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FlowError;
use crate::event::InboundEvent;
use crate::state::StateValue;

/// A directed, optionally labeled edge between two nodes.
///
/// On `condition` nodes the label is matched against the chosen rule's
/// label; the single unlabeled connection, if any, is the default route.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub to: String,
}

impl Connection {
    pub fn to(target: impl Into<String>) -> Self {
        Self { label: None, to: target.into() }
    }

    pub fn labeled(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self { label: Some(label.into()), to: target.into() }
    }
}

/// Validation rule applied to a question answer before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerRule {
    #[default]
    Any,
    /// Answer must parse as a number.
    Number,
    Regex {
        pattern: String,
    },
    OneOf {
        options: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
}

/// Comparison operator for condition rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// One ordered rule of a `condition` node: if the predicate over the
/// execution variables holds, routing follows the connection carrying
/// `label`. First matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConditionRule {
    pub var: String,
    pub op: CompareOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StateValue>,
    pub label: String,
}

/// The closed set of node types. Unknown `type` strings fail at
/// deserialization, never at traversal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    /// Sends templated text (handlebars, rendered against the execution
    /// variables) or media, then continues without consuming the event.
    Message {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
    },
    /// Prompts the contact and suspends the walk until the next inbound
    /// event; the validated answer is stored under `save_key`. Invalid
    /// answers re-prompt up to `max_retries` times before handing off to
    /// a human.
    Question {
        text: String,
        save_key: String,
        #[serde(default)]
        rule: AnswerRule,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_retries: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_text: Option<String>,
    },
    /// Routes on the first matching rule's label. When no rule matches,
    /// the unlabeled default connection is taken; with no default this is
    /// a hard `Predicate` failure. (The system this replaces silently fell
    /// back to the first declared connection instead.)
    Condition {
        rules: Vec<ConditionRule>,
    },
    /// Hands the conversation to a human agent and completes the execution.
    TransferToHuman {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    End,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Message { .. } => "message",
            NodeKind::Question { .. } => "question",
            NodeKind::Condition { .. } => "condition",
            NodeKind::TransferToHuman { .. } => "transfer_to_human",
            NodeKind::End => "end",
        }
    }

    /// Terminal node types never require an outbound connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::End | NodeKind::TransferToHuman { .. })
    }
}

/// A single node's config in the flow.
#[derive(Debug, Clone, JsonSchema, PartialEq)]
pub struct NodeConfig {
    /// Injected from the map key on deserialization; never serialized.
    #[serde(skip)]
    #[schemars(skip)]
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// UI tree-rendering hint only; traversal ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self { id: id.into(), kind, parent: None }
    }
}

// Matches the JSON shape of a node, minus the `id` field.
#[derive(Serialize, Deserialize)]
struct RawNodeConfig {
    #[serde(flatten)]
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
}

// Re-use the normal Serde impl for the map, then inject each key as the
// node's `id`.
fn deserialize_nodes_with_id<'de, D>(deserializer: D) -> Result<HashMap<String, NodeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, RawNodeConfig> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (key, r) in raw {
        out.insert(
            key.clone(),
            NodeConfig { id: key, kind: r.kind, parent: r.parent },
        );
    }
    Ok(out)
}

// Hide `id` again when serializing back out.
fn serialize_nodes<S>(nodes: &HashMap<String, NodeConfig>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(nodes.len()))?;
    for (k, v) in nodes {
        let raw = RawNodeConfig { kind: v.kind.clone(), parent: v.parent.clone() };
        map.serialize_entry(k, &raw)?;
    }
    map.end()
}

/// A condition on an inbound event that starts a new execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Matches when the event body contains any of the keywords.
    Keyword {
        keywords: Vec<String>,
        #[serde(default = "default_true")]
        case_insensitive: bool,
    },
    /// Matches when the event body equals `text` exactly (after trim).
    Exact { text: String },
    /// Matches every inbound event.
    Any,
}

fn default_true() -> bool {
    true
}

impl Trigger {
    pub fn matches(&self, event: &InboundEvent) -> bool {
        let body = event.body();
        match self {
            Trigger::Keyword { keywords, case_insensitive } => {
                let haystack = if *case_insensitive { body.to_lowercase() } else { body };
                keywords.iter().any(|k| {
                    let needle = if *case_insensitive { k.to_lowercase() } else { k.clone() };
                    !needle.is_empty() && haystack.contains(&needle)
                })
            }
            Trigger::Exact { text } => body.trim() == text,
            Trigger::Any => true,
        }
    }
}

/// A declarative flow: identity, node map, labeled connections, triggers
/// and default variable bindings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    id: String,
    #[serde(default)]
    tenant_id: String,
    name: String,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default = "default_flow_version")]
    version: u32,

    /// node_id → node configuration
    #[serde(
        deserialize_with = "deserialize_nodes_with_id",
        serialize_with = "serialize_nodes"
    )]
    nodes: HashMap<String, NodeConfig>,

    /// adjacency: from node_id → ordered outbound connections
    #[serde(default)]
    connections: HashMap<String, Vec<Connection>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    triggers: Vec<Trigger>,

    /// Default bindings copied into every new execution.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    variables: HashMap<String, StateValue>,

    #[serde(skip)]
    #[schemars(skip)]
    graph: StableDiGraph<String, ()>,
    #[serde(skip)]
    #[schemars(skip)]
    index_of: HashMap<String, NodeIndex>,
}

fn default_active() -> bool {
    true
}

fn default_flow_version() -> u32 {
    1
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.tenant_id == other.tenant_id
            && self.name == other.name
            && self.active == other.active
            && self.version == other.version
            && self.nodes == other.nodes
            && self.connections == other.connections
            && self.triggers == other.triggers
            && self.variables == other.variables
        // graph, index_of are skipped
    }
}

impl Flow {
    /// Create a new, empty flow with the given identifiers.
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Flow {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            active: true,
            version: 1,
            nodes: HashMap::new(),
            connections: HashMap::new(),
            triggers: Vec::new(),
            variables: HashMap::new(),
            graph: StableDiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn variables(&self) -> &HashMap<String, StateValue> {
        &self.variables
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &HashMap<String, NodeConfig> {
        &self.nodes
    }

    /// Ordered outbound connections of a node (empty for terminal nodes).
    pub fn connections_from(&self, id: &str) -> &[Connection] {
        self.connections.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single `start` node id. Only meaningful on a validated flow.
    pub fn start_node_id(&self) -> Result<&str, FlowError> {
        let mut starts = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Start));
        match (starts.next(), starts.next()) {
            (Some(s), None) => Ok(&s.id),
            (None, _) => Err(FlowError::Validation("flow has no start node".into())),
            (Some(_), Some(_)) => Err(FlowError::Validation("flow has more than one start node".into())),
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        self.nodes.insert(id.clone(), NodeConfig::new(id, kind));
        self
    }

    pub fn add_connection(mut self, from: impl Into<String>, connections: Vec<Connection>) -> Self {
        self.connections.insert(from.into(), connections);
        self
    }

    pub fn add_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: StateValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Build the internal graph. Must run after deserialization and before
    /// `validate`/traversal.
    pub fn build(mut self) -> Self {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();

        for nid in self.nodes.keys() {
            let idx = graph.add_node(nid.clone());
            index_of.insert(nid.clone(), idx);
        }

        for (from, conns) in &self.connections {
            if let Some(&i) = index_of.get(from) {
                for conn in conns {
                    if let Some(&j) = index_of.get(&conn.to) {
                        graph.add_edge(i, j, ());
                    }
                }
            }
        }

        self.graph = graph;
        self.index_of = index_of;
        self
    }

    /// Save-time validation. Traversal trusts a validated definition but
    /// still fails gracefully if a node has since been deleted.
    pub fn validate(&self) -> Result<(), FlowError> {
        let start_id = self.start_node_id()?.to_string();

        // every connection source and target must exist
        for (from, conns) in &self.connections {
            if !self.nodes.contains_key(from) {
                return Err(FlowError::Validation(format!(
                    "connection source `{from}` is not a node"
                )));
            }
            for conn in conns {
                if !self.nodes.contains_key(&conn.to) {
                    return Err(FlowError::Validation(format!(
                        "connection `{from}` -> `{}` targets a missing node",
                        conn.to
                    )));
                }
            }
        }

        // reachability from start over the built graph
        let start_idx = self.index_of.get(&start_id).ok_or_else(|| {
            FlowError::Validation("flow graph not built; call build() first".into())
        })?;
        let mut reachable = HashSet::new();
        let mut stack = vec![*start_idx];
        while let Some(n) = stack.pop() {
            if reachable.insert(n) {
                for succ in self.graph.neighbors_directed(n, petgraph::Direction::Outgoing) {
                    stack.push(succ);
                }
            }
        }
        for (nid, idx) in &self.index_of {
            if !reachable.contains(idx) && *nid != start_id {
                return Err(FlowError::Validation(format!(
                    "node `{nid}` is not reachable from start"
                )));
            }
        }

        // per-node outbound rules
        for node in self.nodes.values() {
            let conns = self.connections_from(&node.id);
            match &node.kind {
                NodeKind::Start | NodeKind::Message { .. } | NodeKind::Question { .. } => {
                    if conns.len() != 1 {
                        return Err(FlowError::Validation(format!(
                            "{} node `{}` must have exactly one outbound connection, found {}",
                            node.kind.type_name(),
                            node.id,
                            conns.len()
                        )));
                    }
                }
                NodeKind::Condition { rules } => {
                    if conns.is_empty() {
                        return Err(FlowError::Validation(format!(
                            "condition node `{}` has no outbound connections",
                            node.id
                        )));
                    }
                    let defaults = conns.iter().filter(|c| c.label.is_none()).count();
                    if defaults > 1 {
                        return Err(FlowError::Validation(format!(
                            "condition node `{}` has {} unlabeled default connections, at most one is allowed",
                            node.id, defaults
                        )));
                    }
                    let mut labels = HashSet::new();
                    for label in conns.iter().filter_map(|c| c.label.as_deref()) {
                        if !labels.insert(label) {
                            return Err(FlowError::Validation(format!(
                                "condition node `{}` has duplicate connection label `{}`",
                                node.id, label
                            )));
                        }
                    }
                    for rule in rules {
                        if !labels.contains(rule.label.as_str()) {
                            return Err(FlowError::Validation(format!(
                                "condition node `{}` rule labeled `{}` has no matching connection",
                                node.id, rule.label
                            )));
                        }
                    }
                }
                NodeKind::End | NodeKind::TransferToHuman { .. } => {
                    // no outbound requirement
                }
            }
        }

        Ok(())
    }
}
