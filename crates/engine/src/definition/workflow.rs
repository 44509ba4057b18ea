use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use crate::{definition::WorkflowNode, Result};

/// Immutable declarative description of a workflow graph.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Initial variable bindings, overridden by run input
    #[serde(default)]
    pub variables: Map<String, Value>,

    pub start_node_id: String,

    /// Ordered node list; ids are unique
    pub nodes: Vec<WorkflowNode>,

    /// Binds the workflow's start to an external event source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerDescriptor>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    /// Provider key used to route inbound events (e.g. "github", "webhook")
    pub provider: String,

    /// Procedure that creates the upstream subscription
    pub trigger_procedure_name: String,

    /// Only events of this type start new runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default)]
    pub subscription_config: Map<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(id: &str, start_node_id: &str, nodes: Vec<WorkflowNode>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: default_version(),
            variables: Map::new(),
            start_node_id: start_node_id.to_string(),
            nodes,
            trigger: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        if let Value::Object(map) = variables {
            self.variables = map;
        }
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDescriptor) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// YAML is a superset of JSON, so this accepts either.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            _ => Self::from_yaml_str(&source),
        }
    }

    /// Loads every `.json`, `.yaml` and `.yml` file in a directory, sorted by
    /// file name. Other files are skipped.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            debug!("Loading workflow definition from {}", path.display());
            match Self::load_file(&path) {
                Ok(definition) => definitions.push(definition),
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                }
            }
        }
        Ok(definitions)
    }
}
