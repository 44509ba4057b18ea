use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::workflow::ResumeState;

/// Context shared by the driver loop and any concurrently running branches.
///
/// Locks are only held for the duration of a read or a merge, never across a
/// procedure call, so branches writing the same keys race and the last writer wins.
pub type SharedContext = Arc<RwLock<ExecutionContext>>;

/// Per-run mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub workflow_id: String,

    /// Stable across suspend and resume
    pub execution_id: String,

    pub variables: Map<String, Value>,

    /// Output of every node that produced one, keyed by node id
    pub node_outputs: Map<String, Value>,

    pub current_node_id: Option<String>,

    /// Append-only log of visited nodes
    pub nodes_executed: Vec<String>,

    /// When the run first started, kept across suspensions
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_id: &str, execution_id: &str, variables: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            variables,
            node_outputs: Map::new(),
            current_node_id: None,
            nodes_executed: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Rehydrates a suspended run; `delta` is merged over the stored variables.
    pub fn from_resume(state: &ResumeState, delta: &Map<String, Value>) -> Self {
        let mut variables = state.variables.clone();
        merge(&mut variables, delta);
        Self {
            workflow_id: state.workflow_id.clone(),
            execution_id: state.execution_id.clone(),
            variables,
            node_outputs: state.node_outputs.clone(),
            current_node_id: Some(state.current_node_id.clone()),
            nodes_executed: state.nodes_executed.clone(),
            started_at: state.started_at,
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(RwLock::new(self))
    }

    /// Stores `output` for `node_id` and merges its fields into the variables.
    pub fn record_output(&mut self, node_id: &str, output: Value) {
        if let Value::Object(fields) = &output {
            merge(&mut self.variables, fields);
        }
        self.node_outputs.insert(node_id.to_string(), output);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Scope condition and switch expressions are evaluated against.
    ///
    /// Variables are addressable directly (`amount > 10`) and through
    /// `variables.*`; node outputs through `outputs.*` / `nodeOutputs.*`.
    pub fn expression_scope(&self) -> Value {
        let mut scope = self.variables.clone();
        scope.insert("variables".to_string(), Value::Object(self.variables.clone()));
        scope.insert("outputs".to_string(), Value::Object(self.node_outputs.clone()));
        scope.insert("nodeOutputs".to_string(), Value::Object(self.node_outputs.clone()));
        Value::Object(scope)
    }

    /// Scope procedure configuration templates are rendered against.
    pub fn template_scope(&self) -> Value {
        json!({
            "variables": self.variables,
            "outputs": self.node_outputs,
            "executionId": self.execution_id,
            "workflowId": self.workflow_id,
        })
    }
}

/// Key-wise union of `delta` into `target`; keys present in `delta` win.
pub fn merge(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, value) in delta {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_outputs_merge_into_variables() {
        let mut ctx = ExecutionContext::new(
            "wf",
            "exec",
            json!({"a": 1, "keep": true}).as_object().cloned().unwrap(),
        );
        ctx.record_output("A", json!({"a": 2, "b": 3}));
        ctx.record_output("S", json!("plain"));

        assert_eq!(Value::Object(ctx.variables.clone()), json!({"a": 2, "b": 3, "keep": true}));
        assert_eq!(ctx.node_outputs["A"], json!({"a": 2, "b": 3}));
        assert_eq!(ctx.node_outputs["S"], json!("plain"));
    }

    #[test]
    fn expression_scope_exposes_outputs() {
        let mut ctx = ExecutionContext::new("wf", "exec", Map::new());
        ctx.record_output("A", json!({"result": 5}));

        let scope = ctx.expression_scope();
        assert_eq!(scope["result"], json!(5));
        assert_eq!(scope["variables"]["result"], json!(5));
        assert_eq!(scope["outputs"]["A"]["result"], json!(5));
    }
}
