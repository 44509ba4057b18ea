//! Lifecycle events published while workflows run.
//!
//! Within one execution, events are emitted in the order the corresponding
//! state transitions happen. Nothing is implied across executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::workflow::ResumeState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub workflow_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventKind {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,

    #[serde(rename = "node.started")]
    NodeStarted { node_id: String },

    #[serde(rename = "node.completed")]
    NodeCompleted { node_id: String, output: Value },

    #[serde(rename = "node.failed")]
    NodeFailed { node_id: String, error: String },

    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { duration_ms: u64 },

    #[serde(rename = "workflow.failed")]
    WorkflowFailed { error: String },

    #[serde(rename = "workflow.paused")]
    WorkflowPaused {
        node_id: String,
        resume_state: Box<ResumeState>,
    },

    #[serde(rename = "workflow.resumed")]
    WorkflowResumed { node_id: String },

    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::NodeStarted { .. } => "node.started",
            EventKind::NodeCompleted { .. } => "node.completed",
            EventKind::NodeFailed { .. } => "node.failed",
            EventKind::WorkflowCompleted { .. } => "workflow.completed",
            EventKind::WorkflowFailed { .. } => "workflow.failed",
            EventKind::WorkflowPaused { .. } => "workflow.paused",
            EventKind::WorkflowResumed { .. } => "workflow.resumed",
            EventKind::WorkflowCancelled => "workflow.cancelled",
        }
    }
}

impl ExecutionEvent {
    pub fn new(workflow_id: &str, execution_id: &str, kind: EventKind) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Receives execution events. Implementations decide what to do with them.
pub trait ExecutionNotifier: Send + Sync {
    fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
    fn notify(&self, _event: ExecutionEvent) {}
}

/// Fans events out to any number of subscribers (SSE streams, UIs, tests).
///
/// Slow subscribers lag and lose the oldest events rather than blocking runs.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ExecutionNotifier for BroadcastNotifier {
    fn notify(&self, event: ExecutionEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_dotted_type() {
        let event = ExecutionEvent::new(
            "wf",
            "exec-1",
            EventKind::NodeCompleted {
                node_id: "A".into(),
                output: json!({"result": 5}),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node.completed");
        assert_eq!(value["nodeId"], "A");
        assert_eq!(value["workflowId"], "wf");
        assert_eq!(value["executionId"], "exec-1");

        let started = serde_json::to_value(ExecutionEvent::new("wf", "e", EventKind::WorkflowStarted)).unwrap();
        assert_eq!(started["type"], "workflow.started");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.notify(ExecutionEvent::new("wf", "e", EventKind::WorkflowCancelled));

        assert_eq!(first.recv().await.unwrap().kind, EventKind::WorkflowCancelled);
        assert_eq!(second.recv().await.unwrap().kind.name(), "workflow.cancelled");
    }
}
