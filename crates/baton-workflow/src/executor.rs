use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use baton_agent::budget::ContextBudgetManager;
use baton_agent::guardrails::NonEmptyGuardrail;
use baton_agent::handoff::HandoffController;
use baton_core::config::AppConfig;
use baton_core::error::{BatonError, ErrorKind, Result};
use baton_core::event::{emit, EventBus, WorkflowEvent};
use baton_core::traits::{Chatter, Guardrail, Summarizer, ToolExecutor};
use baton_core::types::RunId;

use crate::context::WorkflowContext;
use crate::definition::{OnError, Step, WorkflowDefinition};
use crate::result::{StepError, StepResult, StepStatus, WorkflowResult};
use crate::retry::RetryGuardrailController;
use crate::validate::{validate, Catalog};

/// Runs workflow definitions against registered agents, tools and guardrails.
pub struct WorkflowExecutor {
    pub(crate) config: AppConfig,
    pub(crate) agents: HashMap<String, Arc<dyn Chatter>>,
    pub(crate) tools: HashMap<String, Arc<dyn ToolExecutor>>,
    pub(crate) guardrails: HashMap<String, Arc<dyn Guardrail>>,
    pub(crate) handoff: HandoffController,
    pub(crate) budget: Option<Arc<ContextBudgetManager>>,
    pub(crate) event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl WorkflowExecutor {
    pub fn new(config: AppConfig) -> Self {
        let handoff = HandoffController::from_config(&config.handoff);
        let mut guardrails: HashMap<String, Arc<dyn Guardrail>> = HashMap::new();
        guardrails.insert("non_empty".into(), Arc::new(NonEmptyGuardrail));
        Self {
            config,
            agents: HashMap::new(),
            tools: HashMap::new(),
            guardrails,
            handoff,
            budget: None,
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Register an agent for steps and as a handoff target.
    pub fn with_agent(mut self, agent: Arc<dyn Chatter>) -> Self {
        self.handoff.register(agent.clone());
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn ToolExecutor>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrails.insert(guardrail.name().to_string(), guardrail);
        self
    }

    /// Summarizer for handoffs using the `summary` context policy.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.handoff = self.handoff.with_summarizer(summarizer);
        self
    }

    /// Budget agent prompts and handoff payloads.
    pub fn with_budget(mut self, budget: ContextBudgetManager) -> Self {
        let budget = Arc::new(budget);
        self.handoff = self.handoff.with_budget(budget.clone());
        self.budget = Some(budget);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.handoff = self.handoff.with_event_bus(event_bus.clone());
        self.event_bus = Some(event_bus);
        self
    }

    /// Cancelling this token aborts every run started by [`run`](Self::run).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Names of everything registered with this executor.
    pub fn catalog(&self) -> Catalog {
        Catalog {
            agents: self.agents.keys().cloned().collect(),
            tools: self.tools.keys().cloned().collect(),
            guardrails: self.guardrails.keys().cloned().collect(),
        }
    }

    /// Check `def` against the registered collaborators.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<()> {
        validate(def, &[], Some(&self.catalog()))
    }

    /// Validate and run `def`.
    ///
    /// Configuration errors are returned before any step starts. Step
    /// failures do not make this return `Err`; they are reported in the
    /// [`WorkflowResult`].
    pub async fn run(&self, def: &WorkflowDefinition, initial: WorkflowContext) -> Result<WorkflowResult> {
        self.run_with_cancel(def, initial, self.cancel.child_token()).await
    }

    /// Like [`run`](Self::run), aborting when `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        def: &WorkflowDefinition,
        initial: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult> {
        let supplied: Vec<String> = initial.data().keys().cloned().collect();
        validate(def, &supplied, Some(&self.catalog()))?;

        let started = Instant::now();
        let scope = RunScope {
            run_id: RunId::new(),
            cancel,
            base_dir: def.base_dir.clone(),
            default_agent: def.default_agent.clone(),
        };
        info!(run_id = %scope.run_id, workflow = %def.name, steps = def.steps.len(), "Workflow started");
        emit(
            self.event_bus.as_ref(),
            WorkflowEvent::WorkflowStarted {
                run_id: scope.run_id.clone(),
                workflow: def.name.clone(),
            },
        );

        let mut context = WorkflowContext::from_map(def.variables.clone());
        context.merge(&initial);

        let seq = self.run_sequence(&def.steps, context, &scope).await;
        let status = if seq.results.iter().all(|r| r.status.is_ok()) {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let cancelled = seq.cancelled || scope.cancel.is_cancelled();

        if status == StepStatus::Succeeded {
            info!(run_id = %scope.run_id, workflow = %def.name, elapsed_ms, "Workflow completed");
        } else {
            warn!(run_id = %scope.run_id, workflow = %def.name, elapsed_ms, cancelled, "Workflow failed");
        }
        emit(
            self.event_bus.as_ref(),
            WorkflowEvent::WorkflowCompleted {
                run_id: scope.run_id.clone(),
                workflow: def.name.clone(),
                succeeded: status == StepStatus::Succeeded,
                elapsed_ms,
            },
        );

        Ok(WorkflowResult {
            run_id: scope.run_id,
            name: def.name.clone(),
            status,
            context: seq.context,
            step_results: seq.results,
            elapsed_ms,
            cancelled,
        })
    }

    /// Run `steps` in order against `context`.
    ///
    /// A failing step halts the sequence unless its `on_error` says to carry
    /// on; steps after the halt are reported as pending.
    pub(crate) fn run_sequence<'a>(
        &'a self,
        steps: &'a [Step],
        context: WorkflowContext,
        scope: &'a RunScope,
    ) -> BoxFuture<'a, Sequence> {
        Box::pin(async move {
            let started = Instant::now();
            let mut context = context;
            let mut results = Vec::with_capacity(steps.len());
            let mut written: Vec<String> = Vec::new();
            let mut cancelled = false;
            let mut halted = false;

            for step in steps {
                if !halted && scope.cancel.is_cancelled() {
                    cancelled = true;
                    halted = true;
                }
                if halted {
                    results.push(StepResult::pending(&step.name));
                    continue;
                }

                let (result, halt) = self.run_step(step, &mut context, scope).await;
                for key in &result.variables_written {
                    if !written.contains(key) {
                        written.push(key.clone());
                    }
                }
                if result.error_kind() == Some(ErrorKind::Cancelled) {
                    cancelled = true;
                }
                halted = halt;
                results.push(result);
            }

            Sequence {
                context,
                results,
                written,
                cancelled,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        })
    }

    /// Run one step to a terminal status. The flag says whether the
    /// enclosing sequence must halt.
    async fn run_step(&self, step: &Step, context: &mut WorkflowContext, scope: &RunScope) -> (StepResult, bool) {
        let started = Instant::now();
        info!(run_id = %scope.run_id, step = %step.name, kind = step.kind_name(), "Step started");
        emit(
            self.event_bus.as_ref(),
            WorkflowEvent::StepStarted {
                run_id: scope.run_id.clone(),
                step: step.name.clone(),
            },
        );

        let guardrails: Vec<Arc<dyn Guardrail>> = step
            .guardrails
            .iter()
            .filter_map(|name| self.guardrails.get(name).cloned())
            .collect();
        let controller = RetryGuardrailController::new(&self.config.retry, &scope.run_id, &scope.cancel)
            .with_guardrails(guardrails)
            .with_event_bus(self.event_bus.as_ref());

        let snapshot: &WorkflowContext = context;
        let outcome = controller
            .attempt(step, |attempt| self.resolve(step, snapshot, scope, attempt))
            .await;

        // Nested writes stand even when the step itself failed.
        let mut variables_written = Vec::new();
        for (key, value) in outcome.writes {
            if !variables_written.contains(&key) {
                variables_written.push(key.clone());
            }
            context.set(key, value);
        }

        let (status, value, step_error, halt) = match outcome.value {
            Ok(value) => {
                if let Some(var) = &step.output_variable {
                    context.set(var.clone(), value.clone());
                    if !variables_written.contains(var) {
                        variables_written.push(var.clone());
                    }
                }
                (StepStatus::Succeeded, value, None, false)
            }
            Err(e) => {
                let step_error = Some(StepError::from(&e));
                if matches!(e, BatonError::Cancelled) {
                    warn!(step = %step.name, "Step cancelled");
                    (StepStatus::Failed, serde_json::Value::Null, step_error, true)
                } else {
                    match step.on_error {
                        OnError::Skip => {
                            warn!(step = %step.name, error = %e, "Step failed, skipping");
                            (StepStatus::Skipped, serde_json::Value::Null, step_error, false)
                        }
                        OnError::Continue => {
                            warn!(step = %step.name, error = %e, "Step failed, continuing");
                            (StepStatus::Failed, serde_json::Value::Null, step_error, false)
                        }
                        OnError::Stop | OnError::Retry => {
                            error!(step = %step.name, error = %e, attempts = outcome.attempts, "Step failed");
                            (StepStatus::Failed, serde_json::Value::Null, step_error, true)
                        }
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        emit(
            self.event_bus.as_ref(),
            WorkflowEvent::StepCompleted {
                run_id: scope.run_id.clone(),
                step: step.name.clone(),
                status: status.to_string(),
                attempts: outcome.attempts,
                elapsed_ms,
                error_kind: step_error.as_ref().map(|e| e.kind),
            },
        );
        info!(step = %step.name, status = %status, attempts = outcome.attempts, elapsed_ms, "Step finished");

        let result = StepResult {
            name: step.name.clone(),
            status,
            value,
            variables_written,
            error: step_error,
            attempts: outcome.attempts,
            elapsed_ms,
            children: outcome.children,
        };
        (result, halt)
    }
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

/// Per-run state shared by every resolver of that run.
#[derive(Debug, Clone)]
pub(crate) struct RunScope {
    pub run_id: RunId,
    pub cancel: CancellationToken,
    pub base_dir: Option<PathBuf>,
    pub default_agent: Option<String>,
}

impl RunScope {
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

/// Outcome of running a list of steps.
#[derive(Debug)]
pub(crate) struct Sequence {
    pub context: WorkflowContext,
    pub results: Vec<StepResult>,
    /// Keys written by the steps, in first-write order.
    pub written: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl Sequence {
    /// First failed step.
    pub fn failure(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.is_failed())
    }

    pub fn error_free(&self) -> bool {
        !self.cancelled && self.failure().is_none()
    }

    /// Final values of every written key.
    pub fn writes(&self) -> Vec<(String, serde_json::Value)> {
        self.written
            .iter()
            .filter_map(|k| self.context.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Value of the last step that ran.
    pub fn value(&self) -> serde_json::Value {
        self.results
            .iter()
            .rev()
            .find(|r| r.status != StepStatus::Pending)
            .map(|r| r.value.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    /// The error that fails the enclosing compound step, named after `name`.
    pub fn error(&self, name: &str) -> Option<BatonError> {
        if self.cancelled {
            return Some(BatonError::Cancelled);
        }
        let failed = self.failure()?;
        let message = failed
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        Some(BatonError::StepFailed {
            step: name.to_string(),
            message: format!("step '{}' failed: {}", failed.name, message),
        })
    }

    pub fn into_result(self, name: String) -> StepResult {
        self.split(name).1
    }

    /// Hand back the context and summarize the rest as one result.
    pub fn split(self, name: String) -> (WorkflowContext, StepResult) {
        let error = self.error(&name).map(|e| StepError::from(&e));
        let value = self.value();
        let status = if error.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Succeeded
        };
        let result = StepResult {
            name,
            status,
            value,
            variables_written: self.written,
            error,
            attempts: 1,
            elapsed_ms: self.elapsed_ms,
            children: self.results,
        };
        (self.context, result)
    }
}
