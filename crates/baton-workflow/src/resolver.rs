//! One resolver per step kind. Resolvers read the workflow context, never
//! write it: anything a step wants to store travels back in its
//! [`Resolution`] and is applied by the executor.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use baton_agent::handoff::{HandoffChain, HandoffRequest};
use baton_core::error::{BatonError, Result};
use baton_core::types::{ChatContext, ChatMessage, MessageMetadata};

use crate::condition::evaluate_condition;
use crate::context::WorkflowContext;
use crate::definition::{
    AgentStep, LoopSource, LoopStep, ParallelStep, RepeatStep, RouteStep, Step, StepKind, ToolStep,
};
use crate::executor::{RunScope, Sequence, WorkflowExecutor};
use crate::result::StepResult;
use crate::retry::Attempt;
use crate::template::{lookup_path, render, render_value};

/// Variable bound to the zero-based iteration number in loops and repeats.
pub const LOOP_INDEX: &str = "loop_index";

/// What one resolver invocation produced.
#[derive(Debug)]
pub struct Resolution {
    pub value: Result<serde_json::Value>,
    /// Context writes made by nested steps.
    pub writes: Vec<(String, serde_json::Value)>,
    pub children: Vec<StepResult>,
}

impl Resolution {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            value: Ok(value),
            writes: vec![],
            children: vec![],
        }
    }

    pub fn err(error: BatonError) -> Self {
        Self {
            value: Err(error),
            writes: vec![],
            children: vec![],
        }
    }
}

impl From<Result<serde_json::Value>> for Resolution {
    fn from(value: Result<serde_json::Value>) -> Self {
        Self {
            value,
            writes: vec![],
            children: vec![],
        }
    }
}

impl WorkflowExecutor {
    /// Dispatch on the step kind.
    pub(crate) fn resolve<'a>(
        &'a self,
        step: &'a Step,
        context: &'a WorkflowContext,
        scope: &'a RunScope,
        attempt: Attempt,
    ) -> BoxFuture<'a, Resolution> {
        Box::pin(async move {
            if scope.cancel.is_cancelled() {
                return Resolution::err(BatonError::Cancelled);
            }
            match &step.kind {
                StepKind::Agent(spec) => self.resolve_agent(step, spec, context, scope, &attempt).await.into(),
                StepKind::Tool(spec) => self.resolve_tool(step, spec, context, scope).await.into(),
                StepKind::Route(spec) => self.resolve_route(step, spec, context, scope).await,
                StepKind::Loop(spec) => self.resolve_loop(step, spec, context, scope).await,
                StepKind::Parallel(spec) => self.resolve_parallel(step, spec, context, scope).await,
                StepKind::Repeat(spec) => self.resolve_repeat(step, spec, context, scope).await,
            }
        })
    }

    async fn resolve_agent(
        &self,
        step: &Step,
        spec: &AgentStep,
        context: &WorkflowContext,
        scope: &RunScope,
        attempt: &Attempt,
    ) -> Result<serde_json::Value> {
        let visible = context.visible(&step.context_policy);
        let mut prompt = render(&step.name, &spec.prompt, &visible)?;
        if let Some(feedback) = &attempt.feedback {
            prompt = format!(
                "{}\n\nYour previous answer was rejected: {}\nRevise your answer to address this.",
                prompt, feedback
            );
        }

        let agent_name = spec
            .agent
            .as_deref()
            .or(scope.default_agent.as_deref())
            .ok_or_else(|| BatonError::InvalidStep {
                step: step.name.clone(),
                message: "no agent named and the workflow has no default agent".into(),
            })?;
        let agent = self
            .agents
            .get(agent_name)
            .cloned()
            .ok_or_else(|| BatonError::UnknownAgent(agent_name.to_string()))?;

        if let Some(budget) = &self.budget {
            let truncated = budget.truncate(&[ChatMessage::user(prompt.clone())], &[]);
            if let Some(last) = truncated.messages.last() {
                prompt = last.content.clone();
            }
        }

        let timeout_secs = step
            .timeout_secs
            .unwrap_or(self.config.workflow.step_timeout_secs);
        debug!(step = %step.name, agent = %agent_name, attempt = attempt.number, "Calling agent");
        let call = agent.chat(prompt.clone(), ChatContext::with_variables(visible.clone()));
        let response = with_deadline(call, timeout_secs, &scope.cancel, || BatonError::AgentTimeout {
            agent: agent_name.to_string(),
            timeout_secs,
        })
        .await?;

        if spec.handoff.is_empty() {
            return Ok(serde_json::Value::String(response));
        }
        let last = self
            .relay(step, spec, agent_name, prompt, response, &visible, scope)
            .await?;
        Ok(serde_json::Value::String(last))
    }

    /// Hand the conversation through each configured target in turn.
    #[allow(clippy::too_many_arguments)]
    async fn relay(
        &self,
        step: &Step,
        spec: &AgentStep,
        first_agent: &str,
        prompt: String,
        response: String,
        visible: &std::collections::HashMap<String, serde_json::Value>,
        scope: &RunScope,
    ) -> Result<String> {
        let mut conversation = vec![ChatMessage::user(prompt), authored(first_agent, response.clone())];
        let mut chain = HandoffChain::new();
        let mut current = first_agent.to_string();
        let mut last = response;

        for target in &spec.handoff {
            let prompt = match &target.prompt {
                Some(template) => render(&step.name, template, visible)?,
                None => format!("Continue the task handed over by {}.", current),
            };
            let mut request = HandoffRequest::from_config(
                &self.config.handoff,
                current.clone(),
                target.to.clone(),
                prompt.clone(),
            );
            if let Some(policy) = target.context_policy {
                request = request.with_policy(policy);
            }
            if let Some(n) = target.max_context_messages {
                request = request.with_max_context_messages(n);
            }
            if let Some(secs) = target.timeout_secs {
                request = request.with_timeout(secs);
            }

            let result = self
                .handoff
                .execute_cancellable(&request, &chain, &conversation, &scope.cancel)
                .await?;
            conversation.push(ChatMessage::user(prompt));
            conversation.push(authored(&target.to, result.response.clone()));
            chain = result.updated_chain;
            current = target.to.clone();
            last = result.response;
        }
        Ok(last)
    }

    async fn resolve_tool(
        &self,
        step: &Step,
        spec: &ToolStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Result<serde_json::Value> {
        let visible = context.visible(&step.context_policy);
        let mut arguments = serde_json::Map::with_capacity(spec.arguments.len());
        for (key, value) in &spec.arguments {
            arguments.insert(key.clone(), render_value(&step.name, value, &visible)?);
        }

        let tool = self
            .tools
            .get(&spec.tool)
            .cloned()
            .ok_or_else(|| BatonError::UnknownTool(spec.tool.clone()))?;
        let timeout_secs = step.timeout_secs.unwrap_or(tool.timeout_secs());
        debug!(step = %step.name, tool = %spec.tool, "Calling tool");
        with_deadline(tool.execute(arguments), timeout_secs, &scope.cancel, || BatonError::ToolTimeout {
            tool: spec.tool.clone(),
            timeout_secs,
        })
        .await
    }

    async fn resolve_route(
        &self,
        step: &Step,
        spec: &RouteStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Resolution {
        let visible = context.visible(&step.context_policy);
        let matched = spec
            .branches
            .iter()
            .position(|b| evaluate_condition(&b.condition, &visible));
        let steps: &[Step] = match (matched, &spec.default) {
            (Some(i), _) => &spec.branches[i].steps,
            (None, Some(default)) => default,
            (None, None) => {
                return Resolution::err(BatonError::MissingDefaultRoute {
                    step: step.name.clone(),
                })
            }
        };
        debug!(step = %step.name, branch = ?matched, "Route selected");

        let seq = self
            .run_sequence(steps, context.scoped(&step.context_policy), scope)
            .await;
        let name = match matched {
            Some(i) => format!("{}[{}]", step.name, i),
            None => format!("{}[default]", step.name),
        };
        let error = seq.error(&name);
        let value = seq.value();
        let writes = seq.writes();
        Resolution {
            value: error.map_or(Ok(value), Err),
            writes,
            children: seq.results,
        }
    }

    async fn resolve_loop(
        &self,
        step: &Step,
        spec: &LoopStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Resolution {
        let items = match self.materialize(step, spec, context, scope).await {
            Ok(items) => items,
            Err(e) => return Resolution::err(e),
        };
        let total = items.len();
        let workers = if spec.parallel {
            spec.max_workers
                .unwrap_or(self.config.workflow.default_max_workers)
                .max(1)
        } else {
            1
        };
        info!(step = %step.name, items = total, workers, "Running loop");

        let base = context.scoped(&step.context_policy);
        let token = scope.cancel.child_token();
        let child_scope = scope.with_cancel(token.clone());
        let cancel_siblings = self.config.workflow.cancel_siblings_on_failure;
        // Set after the first failed iteration; no new iterations start.
        let stop = AtomicBool::new(false);

        let (base, child_scope, token, stop) = (&base, &child_scope, &token, &stop);
        let finished: Vec<(usize, Option<Sequence>)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move {
                if stop.load(Ordering::SeqCst) {
                    return (index, None);
                }
                let mut iteration = base.clone();
                iteration.set(spec.item_var.clone(), item);
                iteration.set(LOOP_INDEX, serde_json::json!(index));
                let seq = self.run_sequence(&spec.body, iteration, child_scope).await;
                if seq.error_free() {
                    return (index, Some(seq));
                }
                stop.store(true, Ordering::SeqCst);
                if cancel_siblings {
                    token.cancel();
                }
                (index, Some(seq))
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        // Slot by source index, not completion order.
        let mut slots: Vec<Option<Sequence>> = (0..total).map(|_| None).collect();
        for (index, seq) in finished {
            slots[index] = seq;
        }

        let mut values = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut children = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            let name = format!("{}[{}]", step.name, index);
            match slot {
                Some(seq) => {
                    errors.extend(seq.error(&name));
                    values.push(seq.value());
                    children.push(seq.into_result(name));
                }
                None => children.push(StepResult::pending(name)),
            }
        }

        Resolution {
            value: pick_error(errors).map_or(Ok(serde_json::Value::Array(values)), Err),
            writes: vec![],
            children,
        }
    }

    async fn materialize(
        &self,
        step: &Step,
        spec: &LoopStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Result<Vec<serde_json::Value>> {
        match &spec.source {
            LoopSource::List(items) => Ok(items.clone()),
            LoopSource::Variable(name) => {
                let visible = context.visible(&step.context_policy);
                match lookup_path(&visible, name) {
                    Some(serde_json::Value::Array(items)) => Ok(items.clone()),
                    Some(serde_json::Value::String(text)) => Ok(lines(text)),
                    Some(other) => Err(BatonError::LoopSource(format!(
                        "variable '{}' is not a list: {}",
                        name, other
                    ))),
                    None => Err(BatonError::UnresolvedVariable {
                        step: step.name.clone(),
                        variable: name.clone(),
                    }),
                }
            }
            LoopSource::File(path) => {
                let path = resolve_path(scope.base_dir.as_deref(), path);
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| BatonError::LoopSource(format!("{}: {}", path.display(), e)))?;
                Ok(lines(&text))
            }
            LoopSource::Csv(path) => read_csv(&resolve_path(scope.base_dir.as_deref(), path)).await,
        }
    }

    async fn resolve_parallel(
        &self,
        step: &Step,
        spec: &ParallelStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Resolution {
        let base = context.scoped(&step.context_policy);
        let token = scope.cancel.child_token();
        let child_scope = scope.with_cancel(token.clone());
        let cancel_siblings = self.config.workflow.cancel_siblings_on_failure;
        info!(step = %step.name, branches = spec.branches.len(), "Running parallel branches");

        let (base, child_scope, token) = (&base, &child_scope, &token);
        let sequences = join_all(spec.branches.iter().map(|branch| async move {
            let seq = self.run_sequence(branch, base.clone(), child_scope).await;
            if cancel_siblings && !seq.error_free() {
                token.cancel();
            }
            seq
        }))
        .await;

        let mut writes = Vec::new();
        let mut values = Vec::with_capacity(sequences.len());
        let mut errors = Vec::new();
        let mut children = Vec::with_capacity(sequences.len());
        // Merge in branch order.
        for (index, seq) in sequences.into_iter().enumerate() {
            let name = format!("{}[{}]", step.name, index);
            writes.extend(seq.writes());
            values.push(seq.value());
            errors.extend(seq.error(&name));
            children.push(seq.into_result(name));
        }

        Resolution {
            value: pick_error(errors).map_or(Ok(serde_json::Value::Array(values)), Err),
            writes,
            children,
        }
    }

    async fn resolve_repeat(
        &self,
        step: &Step,
        spec: &RepeatStep,
        context: &WorkflowContext,
        scope: &RunScope,
    ) -> Resolution {
        let mut current = context.scoped(&step.context_policy);
        let mut written: Vec<String> = Vec::new();
        let mut children = Vec::new();

        for index in 0..spec.max_iterations {
            current.set(LOOP_INDEX, serde_json::json!(index));
            let seq = self.run_sequence(&spec.body, current, scope).await;
            for key in &seq.written {
                if !written.contains(key) {
                    written.push(key.clone());
                }
            }
            let name = format!("{}[{}]", step.name, index);
            let error = seq.error(&name);
            let value = seq.value();
            let (next, result) = seq.split(name);
            current = next;
            children.push(result);

            let writes = collect_writes(&written, &current);
            if let Some(e) = error {
                return Resolution {
                    value: Err(e),
                    writes,
                    children,
                };
            }
            if evaluate_condition(&spec.until, current.data()) {
                debug!(step = %step.name, iterations = index + 1, "Repeat condition met");
                return Resolution {
                    value: Ok(value),
                    writes,
                    children,
                };
            }
        }

        Resolution {
            value: Err(BatonError::StepFailed {
                step: step.name.clone(),
                message: format!(
                    "condition '{}' not met after {} iterations",
                    spec.until, spec.max_iterations
                ),
            }),
            writes: collect_writes(&written, &current),
            children,
        }
    }
}

/// Await `call` under a deadline, aborting early on cancellation.
async fn with_deadline<T>(
    call: impl Future<Output = Result<T>>,
    timeout_secs: u64,
    cancel: &CancellationToken,
    on_timeout: impl FnOnce() -> BatonError,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BatonError::Cancelled),
        outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), call) => {
            outcome.unwrap_or_else(|_| Err(on_timeout()))
        }
    }
}

fn authored(agent: &str, content: String) -> ChatMessage {
    ChatMessage::assistant(content).with_metadata(MessageMetadata {
        protected: false,
        agent: Some(agent.to_string()),
    })
}

/// The first real failure; cancellation only when nothing else failed.
fn pick_error(errors: Vec<BatonError>) -> Option<BatonError> {
    let real = errors.iter().position(|e| !matches!(e, BatonError::Cancelled));
    let index = real.or(if errors.is_empty() { None } else { Some(0) })?;
    errors.into_iter().nth(index)
}

fn collect_writes(keys: &[String], context: &WorkflowContext) -> Vec<(String, serde_json::Value)> {
    keys.iter()
        .filter_map(|k| context.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

fn lines(text: &str) -> Vec<serde_json::Value> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::Value::String(l.to_string()))
        .collect()
}

fn resolve_path(base_dir: Option<&Path>, path: &Path) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// One JSON object per record, keyed by the header row.
async fn read_csv(path: &Path) -> Result<Vec<serde_json::Value>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| BatonError::LoopSource(format!("{}: {}", path.display(), e)))?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        rows.push(serde_json::Value::Object(row));
    }
    Ok(rows)
}
