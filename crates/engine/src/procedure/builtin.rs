use anyhow::{anyhow, Context as _};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    definition::AwaitTimeout,
    procedure::{FnProcedure, InMemoryRegistry, ProcedureError, ProcedureMetadata},
    workflow::{PauseSignal, WaitCondition},
};

/// Registers the procedures every deployment ships with.
pub fn register_builtins(registry: &mut InMemoryRegistry) {
    registry.register(
        FnProcedure::new("core.noop", |_, _| async { Ok(json!({})) })
            .with_description("Does nothing and returns an empty object"),
    );

    registry.register(
        FnProcedure::new("core.log", |input, ctx| async move {
            let message = input
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            info!(
                workflow_id = %ctx.workflow_id,
                execution_id = %ctx.execution_id,
                node_id = ctx.node_id.as_deref().unwrap_or("-"),
                "{}",
                message
            );
            Ok(json!({ "logged": message }))
        })
        .with_description("Writes `message` to the log"),
    );

    registry.register(
        FnProcedure::new("core.set", |input, _| async move {
            match input.get("values") {
                Some(Value::Object(values)) => Ok(Value::Object(values.clone())),
                Some(other) => Err(ProcedureError::failed(format!(
                    "core.set expects an object under 'values', got {}",
                    other
                ))),
                None => Ok(json!({})),
            }
        })
        .with_description("Returns the `values` object so it is merged into variables"),
    );

    registry.register(
        FnProcedure::new("core.suspend", |input, _| async move {
            Err(ProcedureError::Suspend(suspend_signal(&input)?))
        })
        .with_description("Suspends the run until one of `waitFor` arrives"),
    );

    registry.register(
        FnProcedure::new("math.add", |input, _| async move {
            let a = operand(&input, "a")?;
            let b = operand(&input, "b")?;
            let result = match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => json!(a.checked_add(b).ok_or_else(|| {
                    ProcedureError::failed(format!("{} + {} overflows a 64-bit integer", a, b))
                })?),
                _ => json!(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()),
            };
            Ok(json!({ "result": result }))
        })
        .with_description("Adds `a` and `b`"),
    );

    registry.register(
        FnProcedure::new("http.request", |input, _| async move {
            http_request(&input).await.map_err(ProcedureError::Failed)
        })
        .with_description("Performs an HTTP request and returns its status and body"),
    );

    registry.register(
        FnProcedure::new("webhook.watch", |input, _| async move {
            let webhook_url = input
                .get("webhookUrl")
                .and_then(Value::as_str)
                .ok_or_else(|| ProcedureError::failed("webhook.watch requires 'webhookUrl'"))?;
            let id = Uuid::new_v4().to_string();
            let mut output = json!({
                "id": id,
                "channelId": format!("channel-{}", id),
                "webhookUrl": webhook_url,
            });
            if let Some(resource) = input.get("resource").and_then(Value::as_str) {
                output["resourceId"] = json!(resource);
            }
            if let Some(ttl) = input.get("ttlSeconds").and_then(Value::as_i64) {
                output["expiration"] = json!((Utc::now() + Duration::seconds(ttl)).to_rfc3339());
            }
            Ok(output)
        })
        .with_description("Registers a generic webhook channel")
        .with_metadata(ProcedureMetadata {
            provider: Some("webhook".to_string()),
            stop_procedure: Some("webhook.stop".to_string()),
        }),
    );

    registry.register(
        FnProcedure::new("webhook.stop", |input, _| async move {
            let id = input.get("id").cloned().unwrap_or(Value::Null);
            info!("Stopped webhook channel {}", id);
            Ok(json!({ "stopped": true, "id": id }))
        })
        .with_description("Tears down a channel created by webhook.watch"),
    );
}

fn operand<'a>(input: &'a Value, key: &str) -> Result<&'a Value, ProcedureError> {
    match input.get(key) {
        Some(value) if value.is_number() => Ok(value),
        Some(other) => Err(ProcedureError::failed(format!(
            "'{}' must be a number, got {}",
            key, other
        ))),
        None => Err(ProcedureError::failed(format!("missing operand '{}'", key))),
    }
}

fn suspend_signal(input: &Value) -> Result<PauseSignal, ProcedureError> {
    let procedures: Vec<String> = match input.get("waitFor") {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if procedures.is_empty() {
        return Err(ProcedureError::failed("core.suspend requires 'waitFor'"));
    }

    let timeout = input
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map(|duration_ms| AwaitTimeout {
            duration_ms,
            node: input
                .get("timeoutNode")
                .and_then(Value::as_str)
                .map(str::to_string),
        });

    Ok(PauseSignal {
        reason: input
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("suspended by procedure")
            .to_string(),
        waiting_for: WaitCondition {
            procedures,
            filter: input
                .get("filter")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        timeout,
        data: input.get("data").cloned().unwrap_or(Value::Null),
    })
}

async fn http_request(input: &Value) -> anyhow::Result<Value> {
    let url = input
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("http.request requires 'url'"))?;
    let url = url::Url::parse(url).with_context(|| format!("invalid url '{}'", url))?;
    let method = input
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{}'", method))?;

    let mut request = reqwest::Client::new().request(method, url);
    if let Some(Value::Object(headers)) = input.get("headers") {
        for (name, value) in headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(name.as_str(), value);
        }
    }
    if let Some(body) = input.get("body") {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let mut headers = Map::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), json!(value));
        }
    }
    let text = response.text().await?;
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    Ok(json!({ "status": status, "headers": headers, "body": body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{InvocationContext, ProcedureRegistry};

    fn registry() -> InMemoryRegistry {
        let mut registry = InMemoryRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    async fn call(name: &str, input: Value) -> Result<Value, ProcedureError> {
        let registry = registry();
        let procedure = registry.get(name).unwrap();
        procedure.invoke(input, &InvocationContext::default()).await
    }

    #[tokio::test]
    async fn math_add_keeps_integers() {
        assert_eq!(
            call("math.add", json!({"a": 2, "b": 3})).await.unwrap(),
            json!({"result": 5})
        );
        assert_eq!(
            call("math.add", json!({"a": 1.5, "b": 1})).await.unwrap(),
            json!({"result": 2.5})
        );
        assert!(call("math.add", json!({"a": "2", "b": 3})).await.is_err());
    }

    #[tokio::test]
    async fn math_add_reports_integer_overflow() {
        let err = call("math.add", json!({"a": i64::MAX, "b": 1})).await.unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[tokio::test]
    async fn core_suspend_raises_pause_signal() {
        let err = call(
            "core.suspend",
            json!({"waitFor": "approve", "timeoutMs": 500, "filter": "payload.ok"}),
        )
        .await
        .unwrap_err();

        match err {
            ProcedureError::Suspend(signal) => {
                assert_eq!(signal.waiting_for.procedures, vec!["approve"]);
                assert_eq!(signal.waiting_for.filter.as_deref(), Some("payload.ok"));
                assert_eq!(signal.timeout.map(|t| t.duration_ms), Some(500));
            }
            other => panic!("expected suspend, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn webhook_watch_links_its_stop_procedure() {
        let registry = registry();
        let watch = registry.get("webhook.watch").unwrap();
        assert_eq!(
            watch.contract().metadata.stop_procedure.as_deref(),
            Some("webhook.stop")
        );

        let output = watch
            .invoke(
                json!({"webhookUrl": "http://localhost/webhooks/webhook", "resource": "repo"}),
                &InvocationContext::default(),
            )
            .await
            .unwrap();
        assert!(output["id"].is_string());
        assert_eq!(output["resourceId"], "repo");

        assert!(call("webhook.watch", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn core_set_returns_values() {
        assert_eq!(
            call("core.set", json!({"values": {"approved": true}}))
                .await
                .unwrap(),
            json!({"approved": true})
        );
    }
}
