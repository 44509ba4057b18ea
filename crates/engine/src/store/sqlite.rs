use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::{
    store::{DatabaseConfig, ExecutionOutcome, ExecutionRecord, Store},
    trigger::TriggerSubscription,
    workflow::{ExecutionStatus, ResumeState},
    Error, Result,
};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to SQLite database: {}", config.sqlite_path.display());

        let (options, pool_options) = if config.is_in_memory() {
            // Every connection to :memory: is its own database, so keep exactly one alive
            (
                SqliteConnectOptions::from_str("sqlite::memory:")?,
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            )
        } else {
            if let Some(parent) = config.sqlite_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            (
                SqliteConnectOptions::new()
                    .filename(&config.sqlite_path)
                    .create_if_missing(true),
                SqlitePoolOptions::new().max_connections(config.max_connections),
            )
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }

    /// A migrated, empty in-memory store.
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect(&DatabaseConfig::in_memory()).await?;
        store.init().await?;
        Ok(store)
    }

    fn execution_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
        let status: String = row.get("status");
        let nodes_executed: String = row.get("nodes_executed");
        let output = row
            .get::<Option<String>, _>("output")
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(ExecutionRecord {
            execution_id: row.get("execution_id"),
            workflow_id: row.get("workflow_id"),
            status: status.parse::<ExecutionStatus>()?,
            started_at: row.get::<DateTime<Utc>, _>("started_at"),
            finished_at: row.get::<Option<DateTime<Utc>>, _>("finished_at"),
            duration_ms: row.get("duration_ms"),
            nodes_executed: serde_json::from_str(&nodes_executed)?,
            output,
            error: row.get("error"),
        })
    }

    fn subscription_from_row(row: &SqliteRow) -> Result<TriggerSubscription> {
        let metadata: String = row.get("metadata");
        Ok(TriggerSubscription {
            workflow_id: row.get("workflow_id"),
            subscription_id: row.get("subscription_id"),
            provider: row.get("provider"),
            trigger_procedure_name: row.get("trigger_procedure_name"),
            channel_id: row.get("channel_id"),
            resource_id: row.get("resource_id"),
            metadata: serde_json::from_str(&metadata)?,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            expires_at: row.get::<Option<DateTime<Utc>>, _>("expires_at"),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn save_execution(&self, record: ExecutionRecord) -> Result<()> {
        debug!("Saving execution: {}", record.execution_id);

        let nodes_executed = serde_json::to_string(&record.nodes_executed)?;
        let output = record
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, workflow_id, status, started_at, finished_at,
                duration_ms, nodes_executed, output, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(execution_id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                duration_ms = excluded.duration_ms,
                nodes_executed = excluded.nodes_executed,
                output = excluded.output,
                error = excluded.error
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.workflow_id)
        .bind(record.status.to_string())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(nodes_executed)
        .bind(output)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_execution(&self, execution_id: &str, outcome: ExecutionOutcome) -> Result<()> {
        debug!("Updating execution {} to {}", execution_id, outcome.status);

        let nodes_executed = serde_json::to_string(&outcome.nodes_executed)?;
        let output = outcome
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?2, output = ?3, error = ?4, finished_at = ?5,
                duration_ms = ?6, nodes_executed = ?7
            WHERE execution_id = ?1
            "#,
        )
        .bind(execution_id)
        .bind(outcome.status.to_string())
        .bind(output)
        .bind(&outcome.error)
        .bind(outcome.finished_at)
        .bind(outcome.duration_ms)
        .bind(nodes_executed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("execution {}", execution_id)));
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        debug!("Getting execution: {}", execution_id);

        let row = sqlx::query(
            r#"
            SELECT execution_id, workflow_id, status, started_at, finished_at,
                   duration_ms, nodes_executed, output, error
            FROM executions
            WHERE execution_id = ?1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::execution_from_row).transpose()
    }

    async fn list_executions(&self, workflow_id: Option<&str>, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, workflow_id, status, started_at, finished_at,
                   duration_ms, nodes_executed, output, error
            FROM executions
            WHERE ?1 IS NULL OR workflow_id = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn save_resume_state(&self, state: &ResumeState) -> Result<()> {
        debug!("Saving resume state for execution: {}", state.execution_id);

        sqlx::query(
            r#"
            INSERT INTO resume_states (execution_id, workflow_id, state, timeout_at, paused_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(execution_id) DO UPDATE SET
                state = excluded.state,
                timeout_at = excluded.timeout_at,
                paused_at = excluded.paused_at
            "#,
        )
        .bind(&state.execution_id)
        .bind(&state.workflow_id)
        .bind(serde_json::to_string(state)?)
        .bind(state.timeout_at)
        .bind(state.paused_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_resume_state(&self, execution_id: &str) -> Result<()> {
        debug!("Deleting resume state for execution: {}", execution_id);

        sqlx::query("DELETE FROM resume_states WHERE execution_id = ?1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_resume_states(&self) -> Result<Vec<ResumeState>> {
        let rows = sqlx::query("SELECT state FROM resume_states ORDER BY paused_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                serde_json::from_str(&state).map_err(Error::from)
            })
            .collect()
    }

    async fn save_subscription(&self, subscription: &TriggerSubscription) -> Result<()> {
        debug!("Saving subscription for workflow: {}", subscription.workflow_id);

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                workflow_id, subscription_id, provider, trigger_procedure_name,
                channel_id, resource_id, metadata, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(workflow_id) DO UPDATE SET
                subscription_id = excluded.subscription_id,
                provider = excluded.provider,
                trigger_procedure_name = excluded.trigger_procedure_name,
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&subscription.workflow_id)
        .bind(&subscription.subscription_id)
        .bind(&subscription.provider)
        .bind(&subscription.trigger_procedure_name)
        .bind(&subscription.channel_id)
        .bind(&subscription.resource_id)
        .bind(serde_json::to_string(&subscription.metadata)?)
        .bind(subscription.created_at)
        .bind(subscription.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_subscription(&self, workflow_id: &str) -> Result<()> {
        debug!("Deleting subscription for workflow: {}", workflow_id);

        sqlx::query("DELETE FROM subscriptions WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<TriggerSubscription>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, subscription_id, provider, trigger_procedure_name,
                   channel_id, resource_id, metadata, created_at, expires_at
            FROM subscriptions
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::subscription_from_row).collect()
    }
}
