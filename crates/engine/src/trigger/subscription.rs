use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{definition::TriggerDescriptor, procedure::ProcedureMetadata, Error, Result};

lazy_static! {
    static ref WATCH_SUFFIX: Regex = Regex::new(r"\.watch$").unwrap();
    static ref SUBSCRIBE_SUFFIX: Regex = Regex::new(r"\.subscribe$").unwrap();
}

/// An upstream subscription created when a triggered workflow is deployed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSubscription {
    pub workflow_id: String,
    pub subscription_id: String,
    pub provider: String,
    pub trigger_procedure_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// Everything the trigger procedure returned
    #[serde(default)]
    pub metadata: Value,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TriggerSubscription {
    /// Builds a subscription from a trigger procedure's output.
    ///
    /// The output must carry an `id`; `expiration` may be RFC 3339 or epoch
    /// milliseconds, as a string or a number.
    pub fn from_watch_output(workflow_id: &str, trigger: &TriggerDescriptor, output: Value) -> Result<Self> {
        let subscription_id = match output.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(Error::Trigger(format!(
                    "trigger procedure {} returned no subscription id",
                    trigger.trigger_procedure_name
                )))
            }
        };

        let text = |key: &str| output.get(key).and_then(Value::as_str).map(String::from);
        let expires_at = match output.get("expiration") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_expiration(value)?),
        };

        Ok(Self {
            workflow_id: workflow_id.to_string(),
            subscription_id,
            provider: trigger.provider.clone(),
            trigger_procedure_name: trigger.trigger_procedure_name.clone(),
            channel_id: text("channelId"),
            resource_id: text("resourceId"),
            expires_at,
            created_at: Utc::now(),
            metadata: output,
        })
    }

    /// Input handed to the stop procedure.
    pub fn stop_input(&self) -> Value {
        let mut input = match &self.metadata {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        input.insert("id".to_string(), Value::String(self.subscription_id.clone()));
        if let Some(channel_id) = &self.channel_id {
            input.insert("channelId".to_string(), Value::String(channel_id.clone()));
        }
        if let Some(resource_id) = &self.resource_id {
            input.insert("resourceId".to_string(), Value::String(resource_id.clone()));
        }
        Value::Object(input)
    }
}

/// Procedure that tears down a subscription created by `watch_name`.
pub fn stop_procedure_name(watch_name: &str, metadata: &ProcedureMetadata) -> Option<String> {
    if let Some(name) = &metadata.stop_procedure {
        return Some(name.clone());
    }
    if WATCH_SUFFIX.is_match(watch_name) {
        return Some(WATCH_SUFFIX.replace(watch_name, ".stop").into_owned());
    }
    if SUBSCRIBE_SUFFIX.is_match(watch_name) {
        return Some(SUBSCRIBE_SUFFIX.replace(watch_name, ".unsubscribe").into_owned());
    }
    None
}

fn parse_expiration(value: &Value) -> Result<DateTime<Utc>> {
    let invalid = || Error::Trigger(format!("invalid subscription expiration: {}", value));
    let millis = match value {
        Value::Number(n) => n.as_i64().ok_or_else(invalid)?,
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(at) => return Ok(at.with_timezone(&Utc)),
            Err(_) => s.parse::<i64>().map_err(|_| invalid())?,
        },
        _ => return Err(invalid()),
    };
    Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger() -> TriggerDescriptor {
        TriggerDescriptor {
            provider: "webhook".into(),
            trigger_procedure_name: "webhook.watch".into(),
            event_type: None,
            subscription_config: Map::new(),
        }
    }

    #[test]
    fn reads_watch_output() {
        let output = json!({
            "id": "sub-1",
            "channelId": "channel-sub-1",
            "resourceId": "repo/1",
            "expiration": "1700000000000",
            "webhookUrl": "http://localhost/webhooks/webhook",
        });
        let subscription = TriggerSubscription::from_watch_output("wf", &trigger(), output).unwrap();

        assert_eq!(subscription.subscription_id, "sub-1");
        assert_eq!(subscription.channel_id.as_deref(), Some("channel-sub-1"));
        assert_eq!(subscription.resource_id.as_deref(), Some("repo/1"));
        assert_eq!(subscription.expires_at.unwrap().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(subscription.provider, "webhook");

        let input = subscription.stop_input();
        assert_eq!(input["id"], "sub-1");
        assert_eq!(input["webhookUrl"], "http://localhost/webhooks/webhook");
    }

    #[test]
    fn accepts_rfc3339_expiration() {
        let output = json!({"id": "sub-1", "expiration": "2030-01-01T00:00:00Z"});
        let subscription = TriggerSubscription::from_watch_output("wf", &trigger(), output).unwrap();
        assert_eq!(subscription.expires_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn requires_an_id() {
        let err = TriggerSubscription::from_watch_output("wf", &trigger(), json!({"channelId": "c"})).unwrap_err();
        assert!(matches!(err, Error::Trigger(_)));
    }

    #[test]
    fn resolves_stop_procedure() {
        let none = ProcedureMetadata::default();
        assert_eq!(stop_procedure_name("gmail.watch", &none).as_deref(), Some("gmail.stop"));
        assert_eq!(stop_procedure_name("slack.subscribe", &none).as_deref(), Some("slack.unsubscribe"));
        assert_eq!(stop_procedure_name("cron.every", &none), None);

        let declared = ProcedureMetadata {
            provider: None,
            stop_procedure: Some("cron.cancel".into()),
        };
        assert_eq!(stop_procedure_name("cron.every", &declared).as_deref(), Some("cron.cancel"));
    }
}
