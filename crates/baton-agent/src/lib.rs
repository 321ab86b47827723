pub mod budget;
pub mod guardrails;
pub mod handoff;
pub mod tokens;

pub use budget::{ContextBudget, ContextBudgetManager, TruncationReport, Truncated};
pub use guardrails::{JudgeGuardrail, MaxLengthGuardrail, NonEmptyGuardrail, RegexGuardrail};
pub use handoff::{HandoffChain, HandoffController, HandoffRequest, HandoffResult};
pub use tokens::{estimator_from_config, BpeEstimator, CharEstimator, TokenEstimator};
