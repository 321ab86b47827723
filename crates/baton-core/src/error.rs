use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatonError {
    // Configuration errors (detected before execution starts)
    #[error("Duplicate step name: {0}")]
    DuplicateStepName(String),

    #[error("Route step '{step}' has no default branch")]
    MissingDefaultRoute { step: String },

    #[error("Step '{step}' references unresolved variable '{variable}'")]
    UnresolvedVariable { step: String, variable: String },

    #[error("Concurrent branches of '{step}' both write variable '{variable}'")]
    ConflictingOutputVariable { step: String, variable: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown guardrail: {0}")]
    UnknownGuardrail(String),

    #[error("Invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Execution errors
    #[error("Agent call failed: {agent}: {message}")]
    AgentCall { agent: String, message: String },

    #[error("Agent timeout after {timeout_secs}s: {agent}")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Loop source error: {0}")]
    LoopSource(String),

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Guardrails still failing after {attempts} attempts: {message}")]
    GuardrailExhausted { attempts: u32, message: String },

    // Handoff errors
    #[error("Handoff cycle detected: {}", chain.join(" -> "))]
    HandoffCycle { chain: Vec<String> },

    #[error("Handoff depth {depth} exceeds max depth {max_depth}")]
    HandoffDepth { depth: usize, max_depth: usize },

    #[error("Handoff to {agent} timed out after {timeout_secs}s")]
    HandoffTimeout { timeout_secs: u64, agent: String },

    #[error("Cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Format errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Error taxonomy used in step results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    StepExecution,
    GuardrailExhausted,
    HandoffCycle,
    HandoffDepth,
    HandoffTimeout,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::StepExecution => "step_execution",
            Self::GuardrailExhausted => "guardrail_exhausted",
            Self::HandoffCycle => "handoff_cycle",
            Self::HandoffDepth => "handoff_depth",
            Self::HandoffTimeout => "handoff_timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl BatonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateStepName(_)
            | Self::MissingDefaultRoute { .. }
            | Self::UnresolvedVariable { .. }
            | Self::ConflictingOutputVariable { .. }
            | Self::UnknownAgent(_)
            | Self::UnknownTool(_)
            | Self::UnknownGuardrail(_)
            | Self::InvalidStep { .. }
            | Self::Config(_)
            | Self::ConfigNotFound(_) => ErrorKind::Configuration,
            Self::GuardrailExhausted { .. } => ErrorKind::GuardrailExhausted,
            Self::HandoffCycle { .. } => ErrorKind::HandoffCycle,
            Self::HandoffDepth { .. } => ErrorKind::HandoffDepth,
            Self::HandoffTimeout { .. } => ErrorKind::HandoffTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AgentCall { .. }
            | Self::AgentTimeout { .. }
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. }
            | Self::LoopSource(_)
            | Self::StepFailed { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Csv(_) => ErrorKind::StepExecution,
        }
    }

    /// Errors worth another attempt even when the step is not set to `retry`.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AgentTimeout { .. } | Self::ToolTimeout { .. } => true,
            Self::AgentCall { message, .. } | Self::ToolExecution { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("429")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Structural errors are never retried, whatever the step policy says.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration
                | ErrorKind::HandoffCycle
                | ErrorKind::HandoffDepth
                | ErrorKind::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, BatonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BatonError::DuplicateStepName("a".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            BatonError::HandoffDepth { depth: 3, max_depth: 2 }.kind(),
            ErrorKind::HandoffDepth
        );
        assert_eq!(
            BatonError::ToolExecution { tool: "t".into(), message: "boom".into() }.kind(),
            ErrorKind::StepExecution
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(BatonError::AgentTimeout { agent: "a".into(), timeout_secs: 5 }.is_transient());
        assert!(BatonError::AgentCall { agent: "a".into(), message: "HTTP 503".into() }.is_transient());
        assert!(!BatonError::AgentCall { agent: "a".into(), message: "bad prompt".into() }.is_transient());
        assert!(!BatonError::Cancelled.is_transient());
    }

    #[test]
    fn test_cycle_display() {
        let err = BatonError::HandoffCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Handoff cycle detected: a -> b -> a");
        assert!(err.is_structural());
    }
}
