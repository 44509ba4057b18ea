pub mod config;
pub mod definition;
pub mod expression;
pub mod metrics;
pub mod procedure;
pub mod server;
pub mod store;
pub mod template;
pub mod trigger;
pub mod workflow;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),
    #[error("Procedure {name} failed: {source}")]
    Procedure {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Expression error: {0}")]
    Expression(#[from] expression::ExpressionError),
    #[error("Routing error at node {node}: {message}")]
    Routing { node: String, message: String },
    #[error("Step limit of {0} exceeded")]
    StepLimitExceeded(usize),
    #[error("Execution cancelled")]
    Cancelled,
    #[error("Template error: {0}")]
    Template(String),
    #[error("Trigger error: {0}")]
    Trigger(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
