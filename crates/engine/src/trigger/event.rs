use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// An inbound event delivered by a provider's webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub id: String,
    pub provider: String,

    /// Identifies the procedure or callback the event answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(provider: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            trigger_id: None,
            subscription_id: None,
            event_type: None,
            payload,
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_trigger_id(mut self, trigger_id: &str) -> Self {
        self.trigger_id = Some(trigger_id.to_string());
        self
    }

    pub fn with_subscription_id(mut self, subscription_id: &str) -> Self {
        self.subscription_id = Some(subscription_id.to_string());
        self
    }

    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// The shape injected into a run's variables.
    pub fn to_variables(&self) -> Value {
        json!({
            "id": self.id,
            "provider": self.provider,
            "triggerId": self.trigger_id,
            "subscriptionId": self.subscription_id,
            "eventType": self.event_type,
            "payload": self.payload,
            "headers": self.headers,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
