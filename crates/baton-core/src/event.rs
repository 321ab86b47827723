use serde::Serialize;

use crate::error::ErrorKind;
use crate::types::RunId;

/// Structured events emitted by the workflow engines.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow run started.
    WorkflowStarted { run_id: RunId, workflow: String },
    /// A step moved to RUNNING.
    StepStarted { run_id: RunId, step: String },
    /// A step is about to be attempted again.
    StepRetrying {
        run_id: RunId,
        step: String,
        attempt: u32,
        reason: String,
    },
    /// A guardrail rejected a step output.
    GuardrailFailed {
        run_id: RunId,
        step: String,
        guardrail: String,
        message: String,
    },
    /// A step reached a terminal status.
    StepCompleted {
        run_id: RunId,
        step: String,
        status: String,
        attempts: u32,
        elapsed_ms: u64,
        error_kind: Option<ErrorKind>,
    },
    /// A handoff was requested. Emitted before cycle and depth checks, so a
    /// rejected handoff is followed by `HandoffFailed`.
    HandoffRequested {
        source: String,
        target: String,
        depth: usize,
    },
    /// The target agent answered.
    HandoffCompleted {
        source: String,
        target: String,
        elapsed_ms: u64,
    },
    /// A handoff was rejected or timed out.
    HandoffFailed {
        source: String,
        target: String,
        kind: ErrorKind,
        error: String,
    },
    /// A channel was shrunk to fit its budget.
    TruncationApplied {
        channel: String,
        tokens_before: usize,
        tokens_after: usize,
        removed_messages: usize,
    },
    /// A workflow run finished.
    WorkflowCompleted {
        run_id: RunId,
        workflow: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    /// Short name of the event, as used by shell hooks.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::GuardrailFailed { .. } => "guardrail_failed",
            Self::StepCompleted { .. } => "step_completed",
            Self::HandoffRequested { .. } => "handoff_requested",
            Self::HandoffCompleted { .. } => "handoff_completed",
            Self::HandoffFailed { .. } => "handoff_failed",
            Self::TruncationApplied { .. } => "truncation_applied",
            Self::WorkflowCompleted { .. } => "workflow_completed",
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Publish to an optional bus.
pub fn emit(bus: Option<&std::sync::Arc<EventBus>>, event: WorkflowEvent) {
    if let Some(bus) = bus {
        bus.publish(event);
    }
}
