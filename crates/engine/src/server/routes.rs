use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::{metrics, server::AppState, trigger::TriggerEvent, Error};

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics")
        }
    }
}

/// Turns a provider callback into a [`TriggerEvent`] and hands it to the
/// dispatcher in the background.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Rejected webhook body for {}: {}", provider, e);
                return error_response(StatusCode::BAD_REQUEST, "Body must be JSON");
            }
        }
    };

    let mut event = TriggerEvent::new(&provider, payload);
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            event = event.with_header(name.as_str(), value);
        }
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(id) = header("x-event-id") {
        event = event.with_id(id);
    }
    if let Some(trigger_id) = header("x-trigger-id") {
        event = event.with_trigger_id(trigger_id);
    }
    if let Some(subscription_id) = header("x-subscription-id") {
        event = event.with_subscription_id(subscription_id);
    }
    if let Some(event_type) = header("x-event-type") {
        event = event.with_event_type(event_type);
    }

    let event_id = event.id.clone();
    let handlers = state.dispatcher.handler_count(&provider).await;
    info!("Received {} event {} ({} handlers)", provider, event_id, handlers);

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(event).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "eventId": event_id, "handlers": handlers })),
    )
        .into_response()
}

pub async fn paused_executions(State(state): State<AppState>) -> Response {
    Json(state.manager.paused_executions().await).into_response()
}

pub async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(store) = state.manager.engine().store() else {
        return error_response(StatusCode::NOT_FOUND, "Execution not found");
    };

    match store.get_execution(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Execution not found"),
        Err(e) => {
            error!("Failed to load execution {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load execution")
        }
    }
}

pub async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.cancel_pending(&id).await {
        Ok(cancelled) => Json(cancelled).into_response(),
        Err(Error::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Pending execution not found"),
        Err(e) => {
            error!("Failed to cancel execution {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to cancel execution")
        }
    }
}
