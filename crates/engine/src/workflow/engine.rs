use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    definition::{validate, WorkflowDefinition},
    metrics,
    procedure::ProcedureRegistry,
    store::{ExecutionOutcome, ExecutionRecord, Store},
    workflow::{
        context::merge, executor::successors, EventKind, ExecutionContext, ExecutionEvent,
        ExecutionNotifier, ExecutionStatus, NodeExecutor, NoopNotifier, PauseSignal, ResumeState,
        SharedContext, Step,
    },
    Error, Result,
};

pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// Per-run knobs for [`WorkflowEngine::execute_with`] and [`WorkflowEngine::resume_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this id instead of generating one
    pub execution_id: Option<String>,

    /// Checked between node steps
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,

    /// Node outputs keyed by node id; partial on failure
    pub outputs: Map<String, Value>,

    /// Wall time of this pass of the driver loop
    pub execution_time_ms: u64,

    pub nodes_executed: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ResumeState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives a workflow graph from a start node (or a resume point) until it
/// completes, fails, pauses or is cancelled.
pub struct WorkflowEngine {
    registry: Arc<dyn ProcedureRegistry>,
    notifier: Arc<dyn ExecutionNotifier>,
    executor: NodeExecutor,
    store: Option<Arc<dyn Store>>,
    max_steps: usize,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<dyn ProcedureRegistry>) -> Self {
        let notifier: Arc<dyn ExecutionNotifier> = Arc::new(NoopNotifier);
        Self {
            executor: NodeExecutor::new(registry.clone(), notifier.clone()),
            registry,
            notifier,
            store: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
        self.executor = NodeExecutor::new(self.registry.clone(), notifier.clone());
        self.notifier = notifier;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ProcedureRegistry> {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    pub fn notifier(&self) -> &Arc<dyn ExecutionNotifier> {
        &self.notifier
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        let errors = validate(definition, self.registry.as_ref());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Runs `definition` from its start node.
    ///
    /// Only validation problems are returned as `Err`; everything that goes
    /// wrong once the run has started is reported through the result's status.
    pub async fn execute(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
    ) -> Result<WorkflowExecutionResult> {
        self.execute_with(definition, input, RunOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
        options: RunOptions,
    ) -> Result<WorkflowExecutionResult> {
        let definition = definition.into();
        self.validate(&definition)?;

        let execution_id = options
            .execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Run input wins over the definition's initial bindings
        let mut variables = definition.variables.clone();
        match input {
            Value::Object(input) => merge(&mut variables, &input),
            Value::Null => {}
            other => {
                variables.insert("input".to_string(), other);
            }
        }

        let ctx = ExecutionContext::new(&definition.id, &execution_id, variables);
        info!("Starting workflow {} (execution {})", definition.id, execution_id);
        self.notify(&ctx, EventKind::WorkflowStarted);
        if let Some(store) = &self.store {
            let record = ExecutionRecord::started(&execution_id, &definition.id, ctx.started_at);
            if let Err(e) = store.save_execution(record).await {
                warn!("Failed to record start of execution {}: {}", execution_id, e);
            }
        }

        let start = vec![definition.start_node_id.clone()];
        Ok(self.drive(&definition, ctx.shared(), start, options.cancel).await)
    }

    /// Continues a suspended run after the node it paused at.
    ///
    /// `delta` (typically the resuming event's payload) is merged over the
    /// stored variables. Nodes completed before the suspension are never run again.
    pub async fn resume(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        state: ResumeState,
        delta: Map<String, Value>,
    ) -> Result<WorkflowExecutionResult> {
        self.resume_with(definition, state, delta, RunOptions::default())
            .await
    }

    pub async fn resume_with(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        state: ResumeState,
        delta: Map<String, Value>,
        options: RunOptions,
    ) -> Result<WorkflowExecutionResult> {
        let definition = definition.into();
        let paused_at = definition
            .node(&state.current_node_id)
            .ok_or_else(|| Error::NodeNotFound(state.current_node_id.clone()))?;
        let next = successors(paused_at);
        self.resume_from(definition, state, delta, next, options).await
    }

    /// Continues a suspended run at an explicit node instead of the paused
    /// node's successors. Used for timeout transitions.
    pub async fn resume_at(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        state: ResumeState,
        node_id: &str,
        delta: Map<String, Value>,
    ) -> Result<WorkflowExecutionResult> {
        let definition = definition.into();
        if definition.node(node_id).is_none() {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        self.resume_from(
            definition,
            state,
            delta,
            vec![node_id.to_string()],
            RunOptions::default(),
        )
        .await
    }

    async fn resume_from(
        &self,
        definition: Arc<WorkflowDefinition>,
        state: ResumeState,
        delta: Map<String, Value>,
        next: Vec<String>,
        options: RunOptions,
    ) -> Result<WorkflowExecutionResult> {
        self.validate(&definition)?;
        if state.workflow_id != definition.id {
            return Err(Error::Validation(vec![format!(
                "resume state of execution {} belongs to workflow '{}', not '{}'",
                state.execution_id, state.workflow_id, definition.id
            )]));
        }

        let ctx = ExecutionContext::from_resume(&state, &delta);
        info!(
            "Resuming workflow {} (execution {}) after node {}",
            definition.id, state.execution_id, state.current_node_id
        );
        self.notify(&ctx, EventKind::WorkflowResumed {
            node_id: state.current_node_id.clone(),
        });
        self.record_status(&ctx, ExecutionStatus::Running, None, None)
            .await;

        Ok(self.drive(&definition, ctx.shared(), next, options.cancel).await)
    }

    async fn drive(
        &self,
        definition: &Arc<WorkflowDefinition>,
        ctx: SharedContext,
        mut pending: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> WorkflowExecutionResult {
        let started = Instant::now();
        let mut steps = 0usize;

        let outcome: Result<Option<(String, PauseSignal)>> = loop {
            if pending.is_empty() {
                break Ok(None);
            }
            if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                break Err(Error::Cancelled);
            }
            steps += 1;
            if steps > self.max_steps {
                break Err(Error::StepLimitExceeded(self.max_steps));
            }

            let step = if pending.len() == 1 {
                self.executor.run_node(definition, &pending[0], &ctx).await
            } else {
                debug!("Fanning out to {:?}", pending);
                self.executor.run_fan_out(definition, &pending, &ctx).await
            };

            match step {
                Ok(Step::Continue(next)) => pending = next,
                Ok(Step::Suspend { node_id, signal }) => break Ok(Some((node_id, signal))),
                Err(e) => break Err(e),
            }
        };

        let elapsed = started.elapsed();
        metrics::EXECUTION_DURATION_SECONDS.observe(elapsed.as_secs_f64());
        let snapshot = ctx.read().await.clone();

        let mut result = WorkflowExecutionResult {
            execution_id: snapshot.execution_id.clone(),
            workflow_id: snapshot.workflow_id.clone(),
            status: ExecutionStatus::Completed,
            outputs: snapshot.node_outputs.clone(),
            execution_time_ms: elapsed.as_millis() as u64,
            nodes_executed: snapshot.nodes_executed.clone(),
            resume_state: None,
            error: None,
        };

        match outcome {
            Ok(None) => {
                info!(
                    "Workflow {} (execution {}) completed in {:?}",
                    result.workflow_id, result.execution_id, elapsed
                );
                self.notify(&snapshot, EventKind::WorkflowCompleted {
                    duration_ms: result.execution_time_ms,
                });
            }
            Ok(Some((node_id, signal))) => {
                info!(
                    "Workflow {} (execution {}) paused at {}: {}",
                    result.workflow_id, result.execution_id, node_id, signal.reason
                );
                let state = ResumeState::capture(&snapshot, &node_id, signal);
                self.notify(&snapshot, EventKind::WorkflowPaused {
                    node_id,
                    resume_state: Box::new(state.clone()),
                });
                result.status = ExecutionStatus::Paused;
                result.resume_state = Some(state);
            }
            Err(Error::Cancelled) => {
                warn!("Workflow {} (execution {}) cancelled", result.workflow_id, result.execution_id);
                self.notify(&snapshot, EventKind::WorkflowCancelled);
                result.status = ExecutionStatus::Cancelled;
                result.error = Some(Error::Cancelled.to_string());
            }
            Err(e) => {
                error!(
                    "Workflow {} (execution {}) failed: {}",
                    result.workflow_id, result.execution_id, e
                );
                self.notify(&snapshot, EventKind::WorkflowFailed {
                    error: e.to_string(),
                });
                result.status = ExecutionStatus::Failed;
                result.error = Some(e.to_string());
            }
        }

        metrics::EXECUTIONS_TOTAL
            .with_label_values(&[result.status.as_str()])
            .inc();
        self.record_status(
            &snapshot,
            result.status,
            Some(Value::Object(result.outputs.clone())),
            result.error.clone(),
        )
        .await;

        result
    }

    /// Records a status transition. Store failures never change a run's outcome.
    async fn record_status(
        &self,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let Some(store) = &self.store else {
            return;
        };

        let finished_at = status.is_terminal().then(Utc::now);
        let outcome = ExecutionOutcome {
            status,
            output,
            error,
            finished_at,
            duration_ms: finished_at.map(|at| (at - ctx.started_at).num_milliseconds()),
            nodes_executed: ctx.nodes_executed.clone(),
        };
        if let Err(e) = store.complete_execution(&ctx.execution_id, outcome).await {
            warn!(
                "Failed to record status {} for execution {}: {}",
                status, ctx.execution_id, e
            );
        }
    }

    fn notify(&self, ctx: &ExecutionContext, kind: EventKind) {
        self.notifier
            .notify(ExecutionEvent::new(&ctx.workflow_id, &ctx.execution_id, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowNode;
    use crate::procedure::{register_builtins, InMemoryRegistry};
    use crate::store::SqliteStore;
    use crate::workflow::BroadcastNotifier;
    use serde_json::json;

    fn engine() -> WorkflowEngine {
        let mut registry = InMemoryRegistry::new();
        register_builtins(&mut registry);
        WorkflowEngine::new(Arc::new(registry))
    }

    fn approval_flow() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "approval",
            "A",
            vec![
                WorkflowNode::procedure("A", "math.add", json!({"a": 2, "b": 3})).with_next("B"),
                WorkflowNode::await_on("B", &["approve"])
                    .with_timeout(1000, Some("C"))
                    .with_next("D"),
                WorkflowNode::sequential("C"),
                WorkflowNode::procedure("D", "core.set", json!({"values": {"done": true}})),
            ],
        )
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_before_running() {
        let definition = WorkflowDefinition::new("wf", "missing", vec![]);
        let err = engine().execute(definition, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn input_overrides_definition_variables() {
        let definition = WorkflowDefinition::new(
            "wf",
            "A",
            vec![WorkflowNode::procedure("A", "math.add", json!({}))],
        )
        .with_variables(json!({"a": 1, "b": 1}));

        let result = engine().execute(definition, json!({"b": 41})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.outputs["A"], json!({"result": 42}));
    }

    #[tokio::test]
    async fn pause_then_resume_continues_after_await() {
        let engine = engine();
        let definition = Arc::new(approval_flow());

        let paused = engine.execute(definition.clone(), json!({})).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        let state = paused.resume_state.clone().unwrap();
        assert_eq!(state.current_node_id, "B");
        assert!(state.timeout_at.is_some());

        let mut delta = Map::new();
        delta.insert("approved".into(), json!(true));
        let resumed = engine.resume(definition, state, delta).await.unwrap();

        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.execution_id, paused.execution_id);
        assert_eq!(resumed.nodes_executed, vec!["A", "B", "D"]);
        assert_eq!(resumed.outputs["A"], json!({"result": 5}));
        assert_eq!(resumed.outputs["D"], json!({"done": true}));
    }

    #[tokio::test]
    async fn resume_at_timeout_node() {
        let engine = engine();
        let definition = Arc::new(approval_flow());
        let paused = engine.execute(definition.clone(), json!({})).await.unwrap();

        let result = engine
            .resume_at(definition, paused.resume_state.unwrap(), "C", Map::new())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.nodes_executed, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn events_follow_state_transitions() {
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let mut events = notifier.subscribe();
        let engine = engine().with_notifier(notifier);

        engine.execute(approval_flow(), json!({})).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.kind.name());
        }
        assert_eq!(
            names,
            vec![
                "workflow.started",
                "node.started",
                "node.completed",
                "node.started",
                "workflow.paused",
            ]
        );
    }

    #[tokio::test]
    async fn store_tracks_execution_record() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = engine().with_store(store.clone());
        let definition = Arc::new(approval_flow());

        let paused = engine.execute(definition.clone(), json!({})).await.unwrap();
        let record = store.get_execution(&paused.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Paused);
        assert!(record.finished_at.is_none());

        engine
            .resume(definition, paused.resume_state.unwrap(), Map::new())
            .await
            .unwrap();
        let record = store.get_execution(&paused.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.nodes_executed, vec!["A", "B", "D"]);
        assert!(record.duration_ms.is_some());
    }
}
