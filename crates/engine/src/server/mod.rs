mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    trigger::{TriggerManager, WebhookDispatcher},
    Result,
};

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TriggerManager>,
    pub dispatcher: Arc<WebhookDispatcher>,
}

/// Thin HTTP adapter: webhook ingress plus read access to executions.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(manager: Arc<TriggerManager>, dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self {
            state: AppState { manager, dispatcher },
        }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/webhooks/{provider}", post(routes::receive_webhook))
            .route("/executions/paused", get(routes::paused_executions))
            .route(
                "/executions/{id}",
                get(routes::get_execution).delete(routes::cancel_execution),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }

    pub async fn start(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }
}
