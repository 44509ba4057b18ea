use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    definition::{ConditionForm, NodeKind, WorkflowDefinition, WorkflowNode},
    expression::{self, case_key},
    metrics,
    procedure::{InvocationContext, ProcedureError, ProcedureRegistry},
    template,
    workflow::{
        context::merge, EventKind, ExecutionEvent, ExecutionNotifier, PauseSignal, SharedContext,
    },
    Error, Result,
};

/// What a node hands back to whoever is driving the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Continue with these node ids; empty means the path ends here
    Continue(Vec<String>),
    /// Suspend the whole run at `node_id`
    Suspend { node_id: String, signal: PauseSignal },
}

/// Performs the effect of a single node against a shared context.
#[derive(Clone)]
pub struct NodeExecutor {
    registry: Arc<dyn ProcedureRegistry>,
    notifier: Arc<dyn ExecutionNotifier>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<dyn ProcedureRegistry>, notifier: Arc<dyn ExecutionNotifier>) -> Self {
        Self { registry, notifier }
    }

    /// Runs one node: records it in `nodesExecuted`, publishes node events and
    /// applies the node's `onError` redirect to failures.
    pub fn run_node<'a>(
        &'a self,
        definition: &'a Arc<WorkflowDefinition>,
        node_id: &'a str,
        ctx: &'a SharedContext,
    ) -> BoxFuture<'a, Result<Step>> {
        Box::pin(async move {
            let node = definition
                .node(node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

            let (workflow_id, execution_id) = {
                let mut ctx = ctx.write().await;
                ctx.current_node_id = Some(node.id.clone());
                ctx.nodes_executed.push(node.id.clone());
                (ctx.workflow_id.clone(), ctx.execution_id.clone())
            };
            debug!("Executing node {} ({})", node.id, node.kind_name());
            self.notify(&workflow_id, &execution_id, EventKind::NodeStarted {
                node_id: node.id.clone(),
            });
            metrics::NODES_EXECUTED_TOTAL
                .with_label_values(&[node.kind_name()])
                .inc();

            match self.dispatch(definition, node, ctx).await {
                Ok(Step::Continue(next)) => {
                    let output = ctx
                        .read()
                        .await
                        .node_outputs
                        .get(&node.id)
                        .cloned()
                        .unwrap_or(Value::Null);
                    self.notify(&workflow_id, &execution_id, EventKind::NodeCompleted {
                        node_id: node.id.clone(),
                        output,
                    });
                    Ok(Step::Continue(next))
                }
                Ok(suspend) => Ok(suspend),
                Err(e) => {
                    self.notify(&workflow_id, &execution_id, EventKind::NodeFailed {
                        node_id: node.id.clone(),
                        error: e.to_string(),
                    });
                    match &node.on_error {
                        Some(target) => {
                            warn!("Node {} failed, redirecting to {}: {}", node.id, target, e);
                            ctx.write().await.variables.insert(
                                "lastError".to_string(),
                                json!({ "nodeId": node.id, "message": e.to_string() }),
                            );
                            Ok(Step::Continue(vec![target.clone()]))
                        }
                        None => Err(e),
                    }
                }
            }
        })
    }

    /// Runs a fan-out `next` list concurrently and waits for every branch.
    ///
    /// Control joins at a successor only when every branch names the same
    /// single node; otherwise the path ends.
    pub async fn run_fan_out(
        &self,
        definition: &Arc<WorkflowDefinition>,
        ids: &[String],
        ctx: &SharedContext,
    ) -> Result<Step> {
        let steps = self.join_branches(definition, ids, ctx, true).await?;

        let mut successors = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                Step::Continue(next) => successors.push(next),
                suspend => return Ok(suspend),
            }
        }

        let joined = match successors.split_first() {
            Some((first, rest)) if first.len() == 1 && rest.iter().all(|s| s == first) => first.clone(),
            _ => Vec::new(),
        };
        Ok(Step::Continue(joined))
    }

    async fn dispatch(
        &self,
        definition: &Arc<WorkflowDefinition>,
        node: &WorkflowNode,
        ctx: &SharedContext,
    ) -> Result<Step> {
        match &node.kind {
            NodeKind::Procedure {
                procedure_name,
                config,
            } => self.execute_procedure(node, procedure_name.as_deref(), config, ctx).await,
            NodeKind::Condition { .. } => self.evaluate_condition(node, ctx).await,
            NodeKind::Parallel {
                branches,
                wait_for_all,
            } => {
                self.execute_parallel(definition, node, branches, *wait_for_all, ctx)
                    .await
            }
            NodeKind::Sequential => Ok(Step::Continue(successors(node))),
            NodeKind::Await {
                procedures,
                filter,
                timeout,
            } => {
                info!("Node {} awaiting {:?}", node.id, procedures);
                Ok(Step::Suspend {
                    node_id: node.id.clone(),
                    signal: PauseSignal::awaiting(procedures.clone(), filter.clone(), timeout.clone()),
                })
            }
        }
    }

    async fn execute_procedure(
        &self,
        node: &WorkflowNode,
        procedure_name: Option<&str>,
        config: &Map<String, Value>,
        ctx: &SharedContext,
    ) -> Result<Step> {
        let name = procedure_name.ok_or_else(|| {
            Error::ProcedureNotFound(format!("node '{}' declares no procedureName", node.id))
        })?;
        let procedure = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ProcedureNotFound(name.to_string()))?;

        let (input, invocation) = {
            let ctx = ctx.read().await;
            let rendered = template::render_value(&Value::Object(config.clone()), &ctx.template_scope())?;
            let mut input = match rendered {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            // Live variables take precedence over static configuration
            merge(&mut input, &ctx.variables);
            let invocation = InvocationContext {
                workflow_id: ctx.workflow_id.clone(),
                execution_id: ctx.execution_id.clone(),
                node_id: Some(node.id.clone()),
            };
            (Value::Object(input), invocation)
        };

        debug!("Invoking procedure {} for node {}", name, node.id);
        match procedure.invoke(input, &invocation).await {
            Ok(output) => {
                ctx.write().await.record_output(&node.id, output);
                Ok(Step::Continue(successors(node)))
            }
            Err(ProcedureError::Suspend(signal)) => {
                info!("Procedure {} suspended node {}: {}", name, node.id, signal.reason);
                Ok(Step::Suspend {
                    node_id: node.id.clone(),
                    signal,
                })
            }
            Err(ProcedureError::Failed(source)) => Err(Error::Procedure {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn evaluate_condition(&self, node: &WorkflowNode, ctx: &SharedContext) -> Result<Step> {
        let scope = ctx.read().await.expression_scope();
        let form = node.condition_form().ok_or_else(|| Error::Routing {
            node: node.id.clone(),
            message: "condition declares neither an expression nor a switch".to_string(),
        })?;

        let target = match form {
            ConditionForm::Predicate {
                expression,
                true_branch,
                false_branch,
            } => {
                let outcome = expression::evaluate_bool(expression, &scope)?;
                debug!("Condition {} `{}` evaluated to {}", node.id, expression, outcome);
                if outcome {
                    true_branch
                } else {
                    false_branch
                }
            }
            ConditionForm::Switch {
                discriminator,
                cases,
                default,
            } => {
                let key = case_key(&expression::evaluate(discriminator, &scope)?);
                debug!("Switch {} selected case '{}'", node.id, key);
                let branch = cases.get(&key).map(String::as_str).or(default);
                if branch.is_none() {
                    return Err(Error::Routing {
                        node: node.id.clone(),
                        message: format!("no case matches '{}' and no default is declared", key),
                    });
                }
                branch
            }
        };

        Ok(Step::Continue(match target {
            Some(id) => vec![id.to_string()],
            None => successors(node),
        }))
    }

    async fn execute_parallel(
        &self,
        definition: &Arc<WorkflowDefinition>,
        node: &WorkflowNode,
        branches: &[String],
        wait_for_all: bool,
        ctx: &SharedContext,
    ) -> Result<Step> {
        debug!(
            "Parallel node {} forking {} branches (waitForAll={})",
            node.id,
            branches.len(),
            wait_for_all
        );
        let steps = self.join_branches(definition, branches, ctx, wait_for_all).await?;

        if let Some(suspend) = steps
            .into_iter()
            .find(|step| matches!(step, Step::Suspend { .. }))
        {
            return Ok(suspend);
        }
        Ok(Step::Continue(successors(node)))
    }

    /// Spawns each branch as its own task.
    ///
    /// With `wait_for_all` every branch is awaited and the first error is
    /// returned as soon as it is observed; otherwise only the first branch to
    /// finish is. Branches no longer awaited keep running to completion.
    async fn join_branches(
        &self,
        definition: &Arc<WorkflowDefinition>,
        ids: &[String],
        ctx: &SharedContext,
        wait_for_all: bool,
    ) -> Result<Vec<Step>> {
        let mut pending: FuturesUnordered<_> = ids
            .iter()
            .map(|id| {
                let executor = self.clone();
                let definition = definition.clone();
                let ctx = ctx.clone();
                let id = id.clone();
                tokio::spawn(async move { executor.run_node(&definition, &id, &ctx).await })
            })
            .collect();

        let mut steps = Vec::with_capacity(ids.len());
        while let Some(joined) = pending.next().await {
            let step = joined.map_err(|e| Error::Internal(format!("Branch task failed: {}", e)))??;
            steps.push(step);
            if !wait_for_all {
                break;
            }
        }
        Ok(steps)
    }

    fn notify(&self, workflow_id: &str, execution_id: &str, kind: EventKind) {
        self.notifier
            .notify(ExecutionEvent::new(workflow_id, execution_id, kind));
    }
}

/// Ids named by the node's `next`, in declaration order.
pub(crate) fn successors(node: &WorkflowNode) -> Vec<String> {
    node.next
        .as_ref()
        .map(|next| next.ids().into_iter().map(String::from).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{register_builtins, InMemoryRegistry};
    use crate::workflow::{ExecutionContext, NoopNotifier};
    use std::time::{Duration, Instant};

    fn executor() -> NodeExecutor {
        let mut registry = InMemoryRegistry::new();
        register_builtins(&mut registry);
        registry.register_fn("sleep", |input, _| async move {
            let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        });
        registry.register_fn("boom", |_, _| async { Err(ProcedureError::failed("boom")) });
        NodeExecutor::new(Arc::new(registry), Arc::new(NoopNotifier))
    }

    fn context(variables: Value) -> SharedContext {
        ExecutionContext::new("wf", "exec", variables.as_object().cloned().unwrap_or_default()).shared()
    }

    #[tokio::test]
    async fn procedure_input_prefers_variables_over_config() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "A",
            vec![WorkflowNode::procedure("A", "math.add", json!({"a": 2, "b": 3})).with_next("B")],
        ));
        let ctx = context(json!({"b": 10}));

        let step = executor().run_node(&definition, "A", &ctx).await.unwrap();

        assert_eq!(step, Step::Continue(vec!["B".to_string()]));
        let ctx = ctx.read().await;
        assert_eq!(ctx.node_outputs["A"], json!({"result": 12}));
        assert_eq!(ctx.variables["result"], json!(12));
        assert_eq!(ctx.nodes_executed, vec!["A"]);
    }

    #[tokio::test]
    async fn config_templates_render_before_invocation() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "A",
            vec![WorkflowNode::procedure(
                "A",
                "core.set",
                json!({"values": {"greeting": "hi {{ variables.name }}", "n": "{{ variables.n }}"}}),
            )],
        ));
        let ctx = context(json!({"name": "ada", "n": 4}));

        executor().run_node(&definition, "A", &ctx).await.unwrap();

        assert_eq!(ctx.read().await.node_outputs["A"], json!({"greeting": "hi ada", "n": 4}));
    }

    #[tokio::test]
    async fn predicate_routes_on_variables_and_outputs() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "C",
            vec![WorkflowNode::predicate("C", "amount > 100 && outputs.A.result == 5", "T", "F")],
        ));
        let ctx = context(json!({"amount": 150}));
        ctx.write().await.record_output("A", json!({"result": 5}));

        let step = executor().run_node(&definition, "C", &ctx).await.unwrap();
        assert_eq!(step, Step::Continue(vec!["T".to_string()]));
    }

    #[tokio::test]
    async fn failure_redirects_to_on_error() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "A",
            vec![WorkflowNode::procedure("A", "boom", json!({})).with_next("B").with_on_error("E")],
        ));
        let ctx = context(json!({}));

        let step = executor().run_node(&definition, "A", &ctx).await.unwrap();

        assert_eq!(step, Step::Continue(vec!["E".to_string()]));
        assert_eq!(ctx.read().await.variables["lastError"]["nodeId"], "A");
    }

    #[tokio::test]
    async fn parallel_first_finish_does_not_wait_for_slow_branch() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "P",
            vec![
                WorkflowNode::parallel("P", &["fast", "slow"], false).with_next("N"),
                WorkflowNode::procedure("fast", "sleep", json!({"ms": 10})),
                WorkflowNode::procedure("slow", "sleep", json!({"ms": 300})),
            ],
        ));
        let ctx = context(json!({}));

        let started = Instant::now();
        let step = executor().run_node(&definition, "P", &ctx).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(step, Step::Continue(vec!["N".to_string()]));

        // The losing branch is not cancelled
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(ctx.read().await.node_outputs.contains_key("slow"));
    }

    #[tokio::test]
    async fn fan_out_joins_on_common_successor() {
        let definition = Arc::new(WorkflowDefinition::new(
            "wf",
            "S",
            vec![
                WorkflowNode::sequential("S").with_next(vec!["L", "R"]),
                WorkflowNode::sequential("L").with_next("J"),
                WorkflowNode::sequential("R").with_next("J"),
                WorkflowNode::sequential("J"),
            ],
        ));
        let ctx = context(json!({}));
        let ids = vec!["L".to_string(), "R".to_string()];

        let step = executor().run_fan_out(&definition, &ids, &ctx).await.unwrap();
        assert_eq!(step, Step::Continue(vec!["J".to_string()]));
    }
}
