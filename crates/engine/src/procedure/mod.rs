//! Procedures are the named units of work a workflow invokes.
//!
//! The engine only relies on [`ProcedureRegistry::has`]/[`ProcedureRegistry::get`]
//! and [`Procedure::invoke`]; policy wrappers such as retries or auth belong to
//! the procedure implementations themselves.

mod builtin;

pub use builtin::register_builtins;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::workflow::PauseSignal;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureContract {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub metadata: ProcedureMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureMetadata {
    /// Provider a trigger procedure subscribes with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Procedure that tears down what this trigger procedure created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_procedure: Option<String>,
}

/// Identifies the run a procedure is invoked on behalf of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub workflow_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProcedureError {
    /// Not a failure: the procedure asks the engine to suspend the run.
    #[error("suspended: {}", .0.reason)]
    Suspend(PauseSignal),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ProcedureError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        ProcedureError::Failed(anyhow::anyhow!("{}", message))
    }
}

#[async_trait]
pub trait Procedure: Send + Sync {
    fn contract(&self) -> &ProcedureContract;

    async fn invoke(&self, input: Value, ctx: &InvocationContext) -> Result<Value, ProcedureError>;
}

pub trait ProcedureRegistry: Send + Sync {
    fn has(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Option<Arc<dyn Procedure>>;
}

type Handler =
    Box<dyn Fn(Value, InvocationContext) -> BoxFuture<'static, Result<Value, ProcedureError>> + Send + Sync>;

/// A procedure backed by an async closure.
pub struct FnProcedure {
    contract: ProcedureContract,
    handler: Handler,
}

impl FnProcedure {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        Self {
            contract: ProcedureContract {
                name: name.to_string(),
                ..Default::default()
            },
            handler: Box::new(move |input, ctx| Box::pin(handler(input, ctx))),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.contract.description = description.to_string();
        self
    }

    pub fn with_metadata(mut self, metadata: ProcedureMetadata) -> Self {
        self.contract.metadata = metadata;
        self
    }
}

#[async_trait]
impl Procedure for FnProcedure {
    fn contract(&self) -> &ProcedureContract {
        &self.contract
    }

    async fn invoke(&self, input: Value, ctx: &InvocationContext) -> Result<Value, ProcedureError> {
        (self.handler)(input, ctx.clone()).await
    }
}

#[derive(Default)]
pub struct InMemoryRegistry {
    procedures: HashMap<String, Arc<dyn Procedure>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the contract's name, replacing any previous entry.
    pub fn register(&mut self, procedure: impl Procedure + 'static) {
        let name = procedure.contract().name.clone();
        self.procedures.insert(name, Arc::new(procedure));
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        self.register(FnProcedure::new(name, handler));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ProcedureRegistry for InMemoryRegistry {
    fn has(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.get(name).cloned()
    }
}
