//! Lifecycle of trigger-bound workflows: deployment, event routing into new
//! or suspended runs, timeouts of pending runs and teardown.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    definition::WorkflowDefinition,
    metrics,
    procedure::{InvocationContext, ProcedureError, ProcedureMetadata},
    store::{ExecutionOutcome, Store},
    trigger::{
        matching::{event_type_allowed, find_match},
        subscription::stop_procedure_name,
        EventHandler, TriggerEvent, TriggerSubscription, WebhookDispatcher,
    },
    workflow::{
        context::merge, EventKind, ExecutionEvent, ExecutionStatus, ResumeState, WorkflowEngine,
        WorkflowExecutionResult,
    },
    Error, Result,
};

/// What happens to a pending execution whose await timeout expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Forget the pending state
    #[default]
    Drop,
    /// Forget the pending state and record the execution as failed
    Fail,
    /// Resume at the await node's timeout node, or drop when none is declared
    Transition,
}

impl TimeoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPolicy::Drop => "drop",
            TimeoutPolicy::Fail => "fail",
            TimeoutPolicy::Transition => "transition",
        }
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeoutPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(TimeoutPolicy::Drop),
            "fail" => Ok(TimeoutPolicy::Fail),
            "transition" => Ok(TimeoutPolicy::Transition),
            other => Err(Error::Config(format!("unknown timeout policy '{}'", other))),
        }
    }
}

/// How an inbound event was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Resumed(WorkflowExecutionResult),
    Started(WorkflowExecutionResult),
    Dropped,
}

struct Deployment {
    subscription: TriggerSubscription,
    handler: Arc<dyn EventHandler>,
}

struct PendingExecution {
    state: ResumeState,
    timeout: Option<JoinHandle<()>>,
}

impl PendingExecution {
    fn disarm(self) -> ResumeState {
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        self.state
    }
}

#[derive(Default)]
struct ManagerState {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    deployments: HashMap<String, Deployment>,
    pending: HashMap<String, PendingExecution>,
}

/// Routes a provider's events to one deployed workflow.
struct WorkflowTriggerHandler {
    manager: Weak<TriggerManager>,
    workflow_id: String,
}

#[async_trait]
impl EventHandler for WorkflowTriggerHandler {
    async fn handle(&self, event: TriggerEvent) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let definition = manager
            .definition(&self.workflow_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("workflow {}", self.workflow_id)))?;
        manager.handle_trigger_event(&definition, event).await?;
        Ok(())
    }
}

pub struct TriggerManagerBuilder {
    engine: Arc<WorkflowEngine>,
    dispatcher: Arc<WebhookDispatcher>,
    store: Option<Arc<dyn Store>>,
    timeout_policy: TimeoutPolicy,
}

impl TriggerManagerBuilder {
    /// Defaults to the engine's store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn build(self) -> Arc<TriggerManager> {
        Arc::new_cyclic(|this| TriggerManager {
            engine: self.engine,
            dispatcher: self.dispatcher,
            store: self.store,
            timeout_policy: self.timeout_policy,
            state: Mutex::new(ManagerState::default()),
            this: this.clone(),
        })
    }
}

/// Owns the deployed subscriptions and the pending (paused) executions of
/// this process.
pub struct TriggerManager {
    engine: Arc<WorkflowEngine>,
    dispatcher: Arc<WebhookDispatcher>,
    store: Option<Arc<dyn Store>>,
    timeout_policy: TimeoutPolicy,
    state: Mutex<ManagerState>,
    this: Weak<TriggerManager>,
}

impl TriggerManager {
    pub fn builder(engine: Arc<WorkflowEngine>, dispatcher: Arc<WebhookDispatcher>) -> TriggerManagerBuilder {
        TriggerManagerBuilder {
            store: engine.store().cloned(),
            engine,
            dispatcher,
            timeout_policy: TimeoutPolicy::default(),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout_policy
    }

    /// Makes a definition known so its paused runs can be resumed.
    pub async fn register_workflow(&self, definition: impl Into<Arc<WorkflowDefinition>>) {
        let definition = definition.into();
        self.state
            .lock()
            .await
            .definitions
            .insert(definition.id.clone(), definition);
    }

    pub async fn definition(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.state.lock().await.definitions.get(workflow_id).cloned()
    }

    pub async fn is_deployed(&self, workflow_id: &str) -> bool {
        self.state.lock().await.deployments.contains_key(workflow_id)
    }

    /// Creates the upstream subscription of a trigger workflow and starts
    /// routing its provider's events to it.
    pub async fn deploy(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        webhook_url: &str,
        subscription_config: Map<String, Value>,
    ) -> Result<TriggerSubscription> {
        let definition = definition.into();
        let trigger = definition.trigger.clone().ok_or_else(|| {
            Error::Trigger(format!("workflow {} declares no trigger", definition.id))
        })?;
        self.engine.validate(&definition)?;
        if self.is_deployed(&definition.id).await {
            return Err(Error::Trigger(format!("workflow {} is already deployed", definition.id)));
        }

        let procedure = self
            .engine
            .registry()
            .get(&trigger.trigger_procedure_name)
            .ok_or_else(|| Error::ProcedureNotFound(trigger.trigger_procedure_name.clone()))?;

        let mut input = trigger.subscription_config.clone();
        merge(&mut input, &subscription_config);
        input.insert("webhookUrl".to_string(), Value::String(webhook_url.to_string()));

        info!(
            "Deploying workflow {} via {}",
            definition.id, trigger.trigger_procedure_name
        );
        let ctx = InvocationContext {
            workflow_id: definition.id.clone(),
            execution_id: Uuid::new_v4().to_string(),
            node_id: None,
        };
        let output = procedure
            .invoke(Value::Object(input), &ctx)
            .await
            .map_err(|e| match e {
                ProcedureError::Failed(source) => Error::Procedure {
                    name: trigger.trigger_procedure_name.clone(),
                    source,
                },
                ProcedureError::Suspend(_) => Error::Trigger(format!(
                    "trigger procedure {} cannot suspend",
                    trigger.trigger_procedure_name
                )),
            })?;

        let subscription = TriggerSubscription::from_watch_output(&definition.id, &trigger, output)?;
        let handler: Arc<dyn EventHandler> = Arc::new(WorkflowTriggerHandler {
            manager: self.this.clone(),
            workflow_id: definition.id.clone(),
        });

        {
            let mut state = self.state.lock().await;
            if state.deployments.contains_key(&definition.id) {
                return Err(Error::Trigger(format!("workflow {} is already deployed", definition.id)));
            }
            state.definitions.insert(definition.id.clone(), definition.clone());
            state.deployments.insert(
                definition.id.clone(),
                Deployment {
                    subscription: subscription.clone(),
                    handler: handler.clone(),
                },
            );
        }
        self.dispatcher.register_handler(&trigger.provider, handler).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.save_subscription(&subscription).await {
                warn!("Failed to persist subscription of workflow {}: {}", definition.id, e);
            }
        }

        info!(
            "Workflow {} deployed with subscription {}",
            definition.id, subscription.subscription_id
        );
        Ok(subscription)
    }

    /// Routes an inbound event: resume the earliest matching paused run of
    /// this workflow, else start a new run unless the event type is filtered out.
    pub async fn handle_trigger_event(
        &self,
        definition: &Arc<WorkflowDefinition>,
        event: TriggerEvent,
    ) -> Result<TriggerOutcome> {
        // Taken out of the pending set under the lock, so it is resumed at most once
        let claimed = {
            let mut state = self.state.lock().await;
            let matched = find_match(
                &event,
                state
                    .pending
                    .values()
                    .map(|pending| &pending.state)
                    .filter(|pending| pending.workflow_id == definition.id),
            )
            .map(|pending| pending.execution_id.clone());

            let claimed = matched.and_then(|id| state.pending.remove(&id));
            if claimed.is_some() {
                metrics::PENDING_EXECUTIONS.set(state.pending.len() as i64);
            }
            claimed.map(PendingExecution::disarm)
        };

        if let Some(paused) = claimed {
            info!(
                "Event {} resumes execution {} of workflow {}",
                event.id, paused.execution_id, definition.id
            );
            metrics::TRIGGER_EVENTS_TOTAL.with_label_values(&["resumed"]).inc();
            self.forget_stored(&paused.execution_id).await;

            let result = match self
                .engine
                .resume(definition.clone(), paused.clone(), event_delta(&event))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    self.abandon(&paused, &e).await;
                    return Err(e);
                }
            };
            self.track_result(definition, &result).await;
            return Ok(TriggerOutcome::Resumed(result));
        }

        if let Some(trigger) = &definition.trigger {
            if !event_type_allowed(trigger, &event) {
                debug!(
                    "Event {} of type {:?} dropped for workflow {}",
                    event.id, event.event_type, definition.id
                );
                metrics::TRIGGER_EVENTS_TOTAL.with_label_values(&["dropped"]).inc();
                return Ok(TriggerOutcome::Dropped);
            }
        }

        info!("Event {} starts a new run of workflow {}", event.id, definition.id);
        metrics::TRIGGER_EVENTS_TOTAL.with_label_values(&["started"]).inc();
        let injected = event.to_variables();
        let input = json!({ "event": injected, "trigger": injected });
        let result = self.engine.execute(definition.clone(), input).await?;
        self.track_result(definition, &result).await;
        Ok(TriggerOutcome::Started(result))
    }

    /// Runs a workflow directly and keeps it pending if it pauses.
    pub async fn run(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
    ) -> Result<WorkflowExecutionResult> {
        let definition = definition.into();
        let result = self.engine.execute(definition.clone(), input).await?;
        self.track_result(&definition, &result).await;
        Ok(result)
    }

    /// Tears down a deployment. Local state is always removed; a failing
    /// stop procedure is only logged.
    pub async fn stop(&self, workflow_id: &str) -> Result<()> {
        let (deployment, dropped) = {
            let mut state = self.state.lock().await;
            let deployment = state
                .deployments
                .remove(workflow_id)
                .ok_or_else(|| Error::NotFound(format!("deployment of workflow {}", workflow_id)))?;
            state.definitions.remove(workflow_id);

            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.state.workflow_id == workflow_id)
                .map(|(id, _)| id.clone())
                .collect();
            let dropped: Vec<ResumeState> = ids
                .iter()
                .filter_map(|id| state.pending.remove(id))
                .map(PendingExecution::disarm)
                .collect();
            metrics::PENDING_EXECUTIONS.set(state.pending.len() as i64);
            (deployment, dropped)
        };

        let subscription = deployment.subscription;
        self.dispatcher
            .unregister_handler(&subscription.provider, &deployment.handler)
            .await;

        let watch = self.engine.registry().get(&subscription.trigger_procedure_name);
        let metadata = watch
            .as_ref()
            .map(|procedure| procedure.contract().metadata.clone())
            .unwrap_or_else(ProcedureMetadata::default);

        match stop_procedure_name(&subscription.trigger_procedure_name, &metadata) {
            Some(name) => match self.engine.registry().get(&name) {
                Some(procedure) => {
                    let ctx = InvocationContext {
                        workflow_id: workflow_id.to_string(),
                        execution_id: Uuid::new_v4().to_string(),
                        node_id: None,
                    };
                    if let Err(e) = procedure.invoke(subscription.stop_input(), &ctx).await {
                        warn!(
                            "Stop procedure {} failed for workflow {}: {}",
                            name, workflow_id, e
                        );
                    }
                }
                None => warn!("Stop procedure {} is not registered", name),
            },
            None => debug!(
                "No stop procedure for {}, subscription {} left in place",
                subscription.trigger_procedure_name, subscription.subscription_id
            ),
        }

        for state in &dropped {
            self.forget_stored(&state.execution_id).await;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_subscription(workflow_id).await {
                warn!("Failed to delete subscription of workflow {}: {}", workflow_id, e);
            }
        }

        info!(
            "Workflow {} stopped ({} pending executions dropped)",
            workflow_id,
            dropped.len()
        );
        Ok(())
    }

    /// Paused executions, oldest first.
    pub async fn paused_executions(&self) -> Vec<ResumeState> {
        let mut states: Vec<ResumeState> = self
            .state
            .lock()
            .await
            .pending
            .values()
            .map(|pending| pending.state.clone())
            .collect();
        states.sort_by_key(|state| state.paused_at);
        states
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn subscriptions(&self) -> Vec<TriggerSubscription> {
        let mut subscriptions: Vec<TriggerSubscription> = self
            .state
            .lock()
            .await
            .deployments
            .values()
            .map(|deployment| deployment.subscription.clone())
            .collect();
        subscriptions.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        subscriptions
    }

    /// Removes a paused execution and records it as cancelled.
    pub async fn cancel_pending(&self, execution_id: &str) -> Result<ResumeState> {
        let state = {
            let mut guard = self.state.lock().await;
            let pending = guard
                .pending
                .remove(execution_id)
                .ok_or_else(|| Error::NotFound(format!("pending execution {}", execution_id)))?;
            metrics::PENDING_EXECUTIONS.set(guard.pending.len() as i64);
            pending.disarm()
        };

        info!("Cancelled pending execution {}", execution_id);
        self.forget_stored(execution_id).await;
        self.finish(&state, ExecutionStatus::Cancelled, Error::Cancelled.to_string())
            .await;
        self.engine.notifier().notify(ExecutionEvent::new(
            &state.workflow_id,
            execution_id,
            EventKind::WorkflowCancelled,
        ));
        Ok(state)
    }

    /// Reloads subscriptions and pending executions of registered workflows
    /// from the store. Returns the number of pending executions restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        for subscription in store.list_subscriptions().await? {
            let handler: Arc<dyn EventHandler> = Arc::new(WorkflowTriggerHandler {
                manager: self.this.clone(),
                workflow_id: subscription.workflow_id.clone(),
            });
            {
                let mut state = self.state.lock().await;
                if !state.definitions.contains_key(&subscription.workflow_id)
                    || state.deployments.contains_key(&subscription.workflow_id)
                {
                    debug!(
                        "Skipping stored subscription of workflow {}",
                        subscription.workflow_id
                    );
                    continue;
                }
                state.deployments.insert(
                    subscription.workflow_id.clone(),
                    Deployment {
                        subscription: subscription.clone(),
                        handler: handler.clone(),
                    },
                );
            }
            self.dispatcher
                .register_handler(&subscription.provider, handler)
                .await;
            info!("Restored subscription of workflow {}", subscription.workflow_id);
        }

        let mut restored = 0;
        let stored = store.list_resume_states().await?;
        let mut state = self.state.lock().await;
        for paused in stored {
            if state.pending.contains_key(&paused.execution_id) {
                continue;
            }
            if !state.definitions.contains_key(&paused.workflow_id) {
                warn!(
                    "Pending execution {} belongs to unknown workflow {}, not restored",
                    paused.execution_id, paused.workflow_id
                );
                continue;
            }
            self.arm(&mut state, paused);
            restored += 1;
        }
        metrics::PENDING_EXECUTIONS.set(state.pending.len() as i64);

        info!("Restored {} pending executions", restored);
        Ok(restored)
    }

    async fn track_result(&self, definition: &Arc<WorkflowDefinition>, result: &WorkflowExecutionResult) {
        if let (ExecutionStatus::Paused, Some(paused)) = (result.status, &result.resume_state) {
            self.track(definition.clone(), paused.clone()).await;
        }
    }

    async fn track(&self, definition: Arc<WorkflowDefinition>, paused: ResumeState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_resume_state(&paused).await {
                warn!("Failed to persist pending execution {}: {}", paused.execution_id, e);
            }
        }

        let mut state = self.state.lock().await;
        state
            .definitions
            .entry(definition.id.clone())
            .or_insert(definition);
        debug!(
            "Execution {} pending on {:?}",
            paused.execution_id, paused.waiting_for.procedures
        );
        self.arm(&mut state, paused);
        metrics::PENDING_EXECUTIONS.set(state.pending.len() as i64);
    }

    /// Inserts a pending execution and schedules its timeout. The caller holds
    /// the lock, so an already expired timer cannot fire before the insert.
    fn arm(&self, state: &mut ManagerState, paused: ResumeState) {
        let timeout = paused.remaining(Utc::now()).map(|delay| {
            let manager = self.this.clone();
            let execution_id = paused.execution_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(manager) = manager.upgrade() {
                    manager.expire(execution_id).await;
                }
            })
        });

        if let Some(previous) = state.pending.insert(
            paused.execution_id.clone(),
            PendingExecution { state: paused, timeout },
        ) {
            previous.disarm();
        }
    }

    fn expire(self: Arc<Self>, execution_id: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (paused, definition) = {
                let mut state = self.state.lock().await;
                // Already resumed or cancelled
                let Some(pending) = state.pending.remove(&execution_id) else {
                    return;
                };
                metrics::PENDING_EXECUTIONS.set(state.pending.len() as i64);
                let definition = state.definitions.get(&pending.state.workflow_id).cloned();
                (pending.state, definition)
            };

            self.forget_stored(&execution_id).await;
            metrics::TIMEOUTS_TOTAL
                .with_label_values(&[self.timeout_policy.as_str()])
                .inc();

            match self.timeout_policy {
                TimeoutPolicy::Drop => {
                    info!("Pending execution {} timed out and was dropped", execution_id);
                }
                TimeoutPolicy::Fail => {
                    let error = format!(
                        "timed out waiting for {}",
                        paused.waiting_for.procedures.join(", ")
                    );
                    info!("Pending execution {} {}", execution_id, error);
                    self.finish(&paused, ExecutionStatus::Failed, error.clone()).await;
                    metrics::EXECUTIONS_TOTAL
                        .with_label_values(&[ExecutionStatus::Failed.as_str()])
                        .inc();
                    self.engine.notifier().notify(ExecutionEvent::new(
                        &paused.workflow_id,
                        &execution_id,
                        EventKind::WorkflowFailed { error },
                    ));
                }
                TimeoutPolicy::Transition => match (paused.timeout_node.clone(), definition) {
                    (Some(node), Some(definition)) => {
                        info!("Pending execution {} timed out, continuing at {}", execution_id, node);
                        match self
                            .engine
                            .resume_at(definition.clone(), paused.clone(), &node, Map::new())
                            .await
                        {
                            Ok(result) => self.track_result(&definition, &result).await,
                            Err(e) => self.abandon(&paused, &e).await,
                        }
                    }
                    _ => {
                        info!(
                            "Pending execution {} timed out without a timeout node and was dropped",
                            execution_id
                        );
                    }
                },
            }
        })
    }

    /// Records a claimed execution that could not be resumed as failed.
    async fn abandon(&self, paused: &ResumeState, e: &Error) {
        error!("Failed to resume execution {}: {}", paused.execution_id, e);
        let message = format!("resume failed: {}", e);
        self.finish(paused, ExecutionStatus::Failed, message.clone()).await;
        metrics::EXECUTIONS_TOTAL
            .with_label_values(&[ExecutionStatus::Failed.as_str()])
            .inc();
        self.engine.notifier().notify(ExecutionEvent::new(
            &paused.workflow_id,
            &paused.execution_id,
            EventKind::WorkflowFailed { error: message },
        ));
    }

    async fn forget_stored(&self, execution_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_resume_state(execution_id).await {
                warn!("Failed to delete pending execution {}: {}", execution_id, e);
            }
        }
    }

    async fn finish(&self, paused: &ResumeState, status: ExecutionStatus, error: String) {
        let Some(store) = &self.store else {
            return;
        };
        let finished_at = Utc::now();
        let outcome = ExecutionOutcome {
            status,
            output: Some(Value::Object(paused.node_outputs.clone())),
            error: Some(error),
            finished_at: Some(finished_at),
            duration_ms: Some((finished_at - paused.started_at).num_milliseconds()),
            nodes_executed: paused.nodes_executed.clone(),
        };
        if let Err(e) = store.complete_execution(&paused.execution_id, outcome).await {
            warn!(
                "Failed to record status {} for execution {}: {}",
                status, paused.execution_id, e
            );
        }
    }
}

/// Variables merged into a resumed run: the payload's fields (or the payload
/// under `payload` when it is not an object) plus the event itself.
fn event_delta(event: &TriggerEvent) -> Map<String, Value> {
    let mut delta = match &event.payload {
        Value::Object(fields) => fields.clone(),
        Value::Null => Map::new(),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("payload".to_string(), other.clone());
            wrapped
        }
    };
    delta.insert("event".to_string(), event.to_variables());
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_policy_parses() {
        assert_eq!("drop".parse::<TimeoutPolicy>().unwrap(), TimeoutPolicy::Drop);
        assert_eq!(" Fail ".parse::<TimeoutPolicy>().unwrap(), TimeoutPolicy::Fail);
        assert_eq!("transition".parse::<TimeoutPolicy>().unwrap(), TimeoutPolicy::Transition);
        assert!("retry".parse::<TimeoutPolicy>().is_err());
        assert_eq!(TimeoutPolicy::default().to_string(), "drop");
    }

    #[test]
    fn delta_carries_payload_fields_and_event() {
        let event = TriggerEvent::new("slack", json!({"approved": true})).with_trigger_id("approve");
        let delta = event_delta(&event);
        assert_eq!(delta["approved"], json!(true));
        assert_eq!(delta["event"]["triggerId"], json!("approve"));

        let scalar = TriggerEvent::new("slack", json!("ok"));
        assert_eq!(event_delta(&scalar)["payload"], json!("ok"));
    }
}
