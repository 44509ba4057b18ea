use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::workflow::ExecutionStatus;

/// Queryable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub nodes_executed: Vec<String>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn started(execution_id: &str, workflow_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            nodes_executed: Vec::new(),
            output: None,
            error: None,
        }
    }
}

/// Status transition applied by [`Store::complete_execution`](crate::store::Store::complete_execution).
///
/// `finished_at` stays `None` for non-terminal transitions such as `paused`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub nodes_executed: Vec<String>,
}
