//! Descriptive schema tree.
//!
//! Every chainable can render itself as a [`Node`]; connectors attach a
//! [`Flow`] describing how their children are organized. The tree is purely
//! descriptive: it serializes to JSON for display and tooling, and
//! deserializing regenerates the UUIDs, so a round-tripped schema can never
//! be mistaken for a handle to live pipeline state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::Identity;

/// How a connector organizes its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flow {
    /// Ordered steps executed left to right.
    Steps {
        /// The steps in execution order.
        steps: Vec<Node>,
    },

    /// A primary with ordered backups.
    Fallback {
        /// Tried first.
        primary: Box<Node>,
        /// Tried in order when the primary fails.
        backups: Vec<Node>,
    },

    /// Children racing for a winner.
    Competitors {
        /// The racing children.
        competitors: Vec<Node>,
    },

    /// Key-routed children.
    Routes {
        /// Route key to child.
        routes: BTreeMap<String, Node>,
    },

    /// A single wrapped processor, optionally with an error handler.
    Processor {
        /// The wrapped processor.
        processor: Box<Node>,
        /// Observes errors without altering them.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error_handler: Option<Box<Node>>,
    },

    /// Fire-and-forget background tasks.
    Tasks {
        /// The dispatched children.
        tasks: Vec<Node>,
    },

    /// A synthetic root wrapping one pipeline.
    Root {
        /// The wrapped pipeline.
        root: Box<Node>,
    },
}

/// One node of the descriptive tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Regenerated on deserialize; a displayed schema never resurrects the
    /// original UUIDs.
    #[serde(skip_deserializing, default = "Uuid::new_v4")]
    pub id: Uuid,

    /// The node's short name.
    pub name: String,

    /// The node's optional description.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,

    /// The connector or processor kind, e.g. `"sequence"` or `"transform"`.
    #[serde(rename = "type")]
    pub node_type: String,

    /// How children are organized. Absent for leaves.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flow: Option<Flow>,

    /// Free-form extra detail, e.g. configuration knobs.
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub metadata: Map<String, Value>,
}

impl Node {
    /// A node for `identity` with the given kind and flow.
    pub fn new(identity: &Identity, node_type: impl Into<String>, flow: Option<Flow>) -> Self {
        Self {
            id: identity.id(),
            name: identity.name().to_string(),
            description: identity.description().map(str::to_string),
            node_type: node_type.into(),
            flow,
            metadata: Map::new(),
        }
    }

    /// A leaf node with no flow.
    pub fn leaf(identity: &Identity, node_type: impl Into<String>) -> Self {
        Self::new(identity, node_type, None)
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Wrap this node in a synthetic root, for rendering a whole pipeline.
    pub fn into_root(self) -> Node {
        let root_identity = Identity::new("root");
        Node::new(
            &root_identity,
            "root",
            Some(Flow::Root {
                root: Box::new(self),
            }),
        )
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Best-effort deserialization for display. UUIDs are regenerated.
    pub fn from_json(json: &str) -> serde_json::Result<Node> {
        serde_json::from_str(json)
    }
}
