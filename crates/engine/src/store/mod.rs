mod config;
mod factory;
mod models;
mod sqlite;

pub use config::DatabaseConfig;
pub use factory::create_store;
pub use models::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::{trigger::TriggerSubscription, workflow::ResumeState};

/// Persists what the engine and trigger manager need to survive a restart.
#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Execution records
    async fn save_execution(&self, record: ExecutionRecord) -> crate::Result<()>;
    async fn complete_execution(&self, execution_id: &str, outcome: ExecutionOutcome) -> crate::Result<()>;
    async fn get_execution(&self, execution_id: &str) -> crate::Result<Option<ExecutionRecord>>;
    async fn list_executions(&self, workflow_id: Option<&str>, limit: i64) -> crate::Result<Vec<ExecutionRecord>>;

    // Pending resume states
    async fn save_resume_state(&self, state: &ResumeState) -> crate::Result<()>;
    async fn delete_resume_state(&self, execution_id: &str) -> crate::Result<()>;
    async fn list_resume_states(&self) -> crate::Result<Vec<ResumeState>>;

    // Trigger subscriptions
    async fn save_subscription(&self, subscription: &TriggerSubscription) -> crate::Result<()>;
    async fn delete_subscription(&self, workflow_id: &str) -> crate::Result<()>;
    async fn list_subscriptions(&self) -> crate::Result<Vec<TriggerSubscription>>;
}
