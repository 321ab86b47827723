use serde::Serialize;

use baton_core::error::{BatonError, ErrorKind};
use baton_core::types::RunId;

use crate::context::WorkflowContext;

/// Lifecycle of a step: `Pending -> Running -> {Succeeded, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal states that let a workflow succeed.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BatonError> for StepError {
    fn from(e: &BatonError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub value: serde_json::Value,
    /// Keys this step wrote into the workflow context.
    pub variables_written: Vec<String>,
    pub error: Option<StepError>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Results of nested steps (branches, iterations, bodies).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepResult>,
}

impl StepResult {
    /// A step that was never reached.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            value: serde_json::Value::Null,
            variables_written: vec![],
            error: None,
            attempts: 0,
            elapsed_ms: 0,
            children: vec![],
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// This result or any nested one ended in cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Cancelled)
            || self.children.iter().any(StepResult::was_cancelled)
    }
}

/// Outcome of a whole run. Every step appears in `step_results`, including
/// those never reached.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub name: String,
    pub status: StepStatus,
    pub context: WorkflowContext,
    pub step_results: Vec<StepResult>,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl WorkflowResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn failed_steps(&self) -> Vec<&StepResult> {
        self.step_results.iter().filter(|r| r.is_failed()).collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled || self.step_results.iter().any(StepResult::was_cancelled)
    }

    /// Top-level result by step name.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.name == name)
    }

    pub fn get(&self, variable: &str) -> Option<&serde_json::Value> {
        self.context.get(variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(name: &str, kind: ErrorKind) -> StepResult {
        StepResult {
            status: StepStatus::Failed,
            error: Some(StepError {
                kind,
                message: "boom".into(),
            }),
            attempts: 1,
            ..StepResult::pending(name)
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::Succeeded.to_string(), "succeeded");
        assert!(StepStatus::Skipped.is_ok());
        assert!(!StepStatus::Pending.is_ok());
    }

    #[test]
    fn test_step_error_from_baton_error() {
        let err = BatonError::HandoffDepth { depth: 4, max_depth: 3 };
        let step_err = StepError::from(&err);
        assert_eq!(step_err.kind, ErrorKind::HandoffDepth);
        assert!(step_err.message.contains("max depth 3"));
    }

    #[test]
    fn test_workflow_result_queries() {
        let mut parent = StepResult::pending("loop");
        parent.children.push(failed("loop[0]", ErrorKind::Cancelled));
        let result = WorkflowResult {
            run_id: RunId::new(),
            name: "wf".into(),
            status: StepStatus::Failed,
            context: WorkflowContext::new(),
            step_results: vec![failed("a", ErrorKind::StepExecution), parent],
            elapsed_ms: 5,
            cancelled: false,
        };
        assert!(!result.succeeded());
        assert_eq!(result.failed_steps().len(), 1);
        assert!(result.was_cancelled());
        assert!(result.step("loop").is_some());
    }

    #[test]
    fn test_serialize_status() {
        let json = serde_json::to_value(StepResult::pending("x")).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("children").is_none());
    }
}
