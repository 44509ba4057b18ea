pub mod node;
pub mod validate;
pub mod workflow;

pub use node::{AwaitTimeout, ConditionForm, Next, NodeKind, WorkflowNode};
pub use validate::validate;
pub use workflow::{TriggerDescriptor, WorkflowDefinition};
