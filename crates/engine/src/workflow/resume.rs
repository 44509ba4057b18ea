use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{definition::AwaitTimeout, workflow::ExecutionContext};

/// What a suspended run waits for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitCondition {
    /// Procedure or event names; an inbound event matches by equality or substring
    pub procedures: Vec<String>,

    /// Expression evaluated against `{payload, event, variables, outputs}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Raised by an await node, or by a procedure, to suspend the run.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseSignal {
    pub reason: String,
    pub waiting_for: WaitCondition,
    pub timeout: Option<AwaitTimeout>,
    pub data: Value,
}

impl PauseSignal {
    pub fn awaiting(procedures: Vec<String>, filter: Option<String>, timeout: Option<AwaitTimeout>) -> Self {
        Self {
            reason: format!("awaiting {}", procedures.join(", ")),
            waiting_for: WaitCondition { procedures, filter },
            timeout,
            data: Value::Null,
        }
    }
}

/// Serializable snapshot of a suspended execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub workflow_id: String,
    pub execution_id: String,

    /// The node that suspended; resumption continues at its `next`
    pub current_node_id: String,

    pub variables: Map<String, Value>,
    pub node_outputs: Map<String, Value>,
    pub nodes_executed: Vec<String>,
    pub waiting_for: WaitCondition,

    #[serde(default)]
    pub reason: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,

    /// Where a timeout transition resumes, when the await node declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_node: Option<String>,

    pub paused_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

impl ResumeState {
    pub fn capture(context: &ExecutionContext, node_id: &str, signal: PauseSignal) -> Self {
        let paused_at = Utc::now();
        let (timeout_at, timeout_node) = match signal.timeout {
            Some(timeout) => (
                Some(paused_at + Duration::milliseconds(timeout.duration_ms as i64)),
                timeout.node,
            ),
            None => (None, None),
        };

        Self {
            workflow_id: context.workflow_id.clone(),
            execution_id: context.execution_id.clone(),
            current_node_id: node_id.to_string(),
            variables: context.variables.clone(),
            node_outputs: context.node_outputs.clone(),
            nodes_executed: context.nodes_executed.clone(),
            waiting_for: signal.waiting_for,
            reason: signal.reason,
            data: signal.data,
            timeout_at,
            timeout_node,
            paused_at,
            started_at: context.started_at,
        }
    }

    /// Time left before the wait expires; zero once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.timeout_at
            .map(|at| (at - now).to_std().unwrap_or(std::time::Duration::ZERO))
    }
}
