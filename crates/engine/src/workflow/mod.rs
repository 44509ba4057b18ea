pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod resume;
pub mod state;

pub use context::{ExecutionContext, SharedContext};
pub use engine::{RunOptions, WorkflowEngine, WorkflowExecutionResult, DEFAULT_MAX_STEPS};
pub use events::{BroadcastNotifier, EventKind, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::{NodeExecutor, Step};
pub use resume::{PauseSignal, ResumeState, WaitCondition};
pub use state::ExecutionStatus;
