use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{trigger::TriggerEvent, Result};

/// Receives every inbound event tagged with the provider it is registered for.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: TriggerEvent) -> Result<()>;
}

/// Routes inbound webhook events to the handlers registered per provider.
#[derive(Default)]
pub struct WebhookDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_handler(&self, provider: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(provider.to_string()).or_default().push(handler);
        info!("Registered event handler for provider {}", provider);
    }

    /// Removes `handler` (compared by identity). Returns whether it was registered.
    pub async fn unregister_handler(&self, provider: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(registered) = handlers.get_mut(provider) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = registered.len() != before;
        if registered.is_empty() {
            handlers.remove(provider);
        }
        if removed {
            info!("Unregistered event handler for provider {}", provider);
        }
        removed
    }

    pub async fn handler_count(&self, provider: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(provider)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Delivers `event` to every handler of its provider, in registration
    /// order. Handler failures are logged and do not stop delivery.
    pub async fn dispatch(&self, event: TriggerEvent) -> usize {
        let handlers = self
            .handlers
            .read()
            .await
            .get(&event.provider)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No handlers for provider {}, event {} ignored", event.provider, event.id);
            return 0;
        }

        for handler in &handlers {
            if let Err(e) = handler.handle(event.clone()).await {
                warn!("Handler for provider {} failed on event {}: {}", event.provider, event.id, e);
            }
        }
        handlers.len()
    }
}
