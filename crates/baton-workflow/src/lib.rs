pub mod condition;
pub mod context;
pub mod definition;
pub mod executor;
pub mod resolver;
pub mod result;
pub mod retry;
pub mod template;
pub mod validate;

pub use condition::evaluate_condition;
pub use context::WorkflowContext;
pub use definition::{
    AgentStep, ContextPolicy, HandoffSpec, LoopSource, LoopStep, OnError, ParallelStep, RepeatStep,
    RouteBranch, RouteStep, Step, StepKind, ToolStep, WorkflowDefinition,
};
pub use executor::WorkflowExecutor;
pub use resolver::{Resolution, LOOP_INDEX};
pub use result::{StepError, StepResult, StepStatus, WorkflowResult};
pub use retry::{calculate_backoff, Attempt, AttemptOutcome, RetryGuardrailController};
pub use template::{render, render_value};
pub use validate::{validate, Catalog};
