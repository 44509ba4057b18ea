mod dispatch;
mod event;
mod manager;
pub mod matching;
mod subscription;

pub use dispatch::{EventHandler, WebhookDispatcher};
pub use event::TriggerEvent;
pub use manager::{TimeoutPolicy, TriggerManager, TriggerManagerBuilder, TriggerOutcome};
pub use subscription::{stop_procedure_name, TriggerSubscription};
