//! Handoff — transfer an in-progress conversation from one agent to another.
//!
//! Every transfer is validated before any agent is called: cycles and depth
//! are checked against the [`HandoffChain`] of agents that have already held
//! the conversation. The target receives a payload filtered by the request's
//! context policy, runs under a deadline, and on success the caller gets a
//! new chain; the chain passed in is never modified.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use baton_core::config::{HandoffConfig, HandoffContextPolicy};
use baton_core::error::{BatonError, Result};
use baton_core::event::{EventBus, WorkflowEvent};
use baton_core::traits::{Chatter, Summarizer};
use baton_core::types::{ChatContext, ChatMessage, MessageMetadata, Role};

use crate::budget::ContextBudgetManager;

/// Characters kept per message by the built-in summary.
const SUMMARY_SNIPPET_CHARS: usize = 200;

/// Agents that have held one logical conversation, in handoff order.
///
/// Each successful handoff appends the agent that gave up control, so
/// `depth` is the number of completed handoffs. With cycle detection on, no
/// agent is appended twice and `depth` equals the number of distinct agents;
/// with it off, an agent may recur and `depth` keeps counting transfers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffChain {
    agents: Vec<String>,
    visited: HashSet<String>,
}

impl HandoffChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.agents.len()
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Distinct agents that have held the conversation.
    pub fn distinct_agents(&self) -> usize {
        self.visited.len()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.visited.contains(agent)
    }

    /// A new chain with `agent` appended.
    fn extended(&self, agent: &str) -> Self {
        let mut next = self.clone();
        next.agents.push(agent.to_string());
        next.visited.insert(agent.to_string());
        next
    }
}

/// One requested transfer of control.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub source_agent: String,
    pub target_agent: String,
    pub prompt: String,
    pub context_policy: HandoffContextPolicy,
    pub max_context_messages: usize,
    pub timeout_secs: u64,
    pub detect_cycles: bool,
    pub max_depth: usize,
}

impl HandoffRequest {
    pub fn new(
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::from_config(&HandoffConfig::default(), source_agent, target_agent, prompt)
    }

    pub fn from_config(
        config: &HandoffConfig,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            prompt: prompt.into(),
            context_policy: config.context_policy,
            max_context_messages: config.max_context_messages,
            timeout_secs: config.timeout_secs,
            detect_cycles: config.detect_cycles,
            max_depth: config.max_depth,
        }
    }

    pub fn with_policy(mut self, policy: HandoffContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn with_max_context_messages(mut self, n: usize) -> Self {
        self.max_context_messages = n;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_detect_cycles(mut self, detect: bool) -> Self {
        self.detect_cycles = detect;
        self
    }
}

/// A completed handoff.
#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub handed_off_to: String,
    pub response: String,
    pub updated_chain: HandoffChain,
    /// Messages the target received alongside the prompt.
    pub context_messages: usize,
}

/// Validates and executes handoffs between registered agents.
pub struct HandoffController {
    agents: HashMap<String, Arc<dyn Chatter>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    budget: Option<Arc<ContextBudgetManager>>,
    event_bus: Option<Arc<EventBus>>,
    max_concurrent: usize,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    cancel: CancellationToken,
}

impl HandoffController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            agents: HashMap::new(),
            summarizer: None,
            budget: None,
            event_bus: None,
            max_concurrent: max_concurrent.max(1),
            slots: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &HandoffConfig) -> Self {
        Self::new(config.max_concurrent)
    }

    /// Register an agent under its own name.
    pub fn with_agent(mut self, agent: Arc<dyn Chatter>) -> Self {
        self.register(agent);
        self
    }

    pub fn register(&mut self, agent: Arc<dyn Chatter>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_budget(mut self, budget: Arc<ContextBudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Structural checks, run before anything else.
    pub fn validate(request: &HandoffRequest, chain: &HandoffChain) -> Result<()> {
        if request.detect_cycles
            && (request.target_agent == request.source_agent || chain.contains(&request.target_agent))
        {
            let mut cycle = chain.agents().to_vec();
            cycle.push(request.source_agent.clone());
            cycle.push(request.target_agent.clone());
            return Err(BatonError::HandoffCycle { chain: cycle });
        }

        let depth = chain.depth() + 1;
        if depth > request.max_depth {
            return Err(BatonError::HandoffDepth {
                depth,
                max_depth: request.max_depth,
            });
        }

        Ok(())
    }

    /// Execute a handoff using the controller's own cancellation token.
    pub async fn execute(
        &self,
        request: &HandoffRequest,
        chain: &HandoffChain,
        conversation: &[ChatMessage],
    ) -> Result<HandoffResult> {
        self.execute_cancellable(request, chain, conversation, &self.cancel).await
    }

    /// Execute a handoff that aborts when `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        request: &HandoffRequest,
        chain: &HandoffChain,
        conversation: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<HandoffResult> {
        self.publish(WorkflowEvent::HandoffRequested {
            source: request.source_agent.clone(),
            target: request.target_agent.clone(),
            depth: chain.depth() + 1,
        });

        let result = self.run(request, chain, conversation, cancel).await;
        if let Err(ref e) = result {
            warn!(
                source = %request.source_agent,
                target = %request.target_agent,
                error = %e,
                "Handoff failed"
            );
            self.publish(WorkflowEvent::HandoffFailed {
                source: request.source_agent.clone(),
                target: request.target_agent.clone(),
                kind: e.kind(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn run(
        &self,
        request: &HandoffRequest,
        chain: &HandoffChain,
        conversation: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<HandoffResult> {
        Self::validate(request, chain)?;

        let target = self
            .agents
            .get(&request.target_agent)
            .cloned()
            .ok_or_else(|| BatonError::UnknownAgent(request.target_agent.clone()))?;

        // Bound in-flight handoffs per source; excess requests wait here.
        let slot = self.slot(&request.source_agent);
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(BatonError::Cancelled),
            permit = slot.acquire_owned() => permit.map_err(|_| BatonError::Cancelled)?,
        };

        // One deadline covers both summarizing and the target's answer.
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(request.timeout_secs);

        let payload = self
            .bounded(request, deadline, cancel, self.build_payload(request, conversation))
            .await?;
        let payload = match &self.budget {
            Some(budget) => budget.truncate(&payload, &[]).messages,
            None => payload,
        };
        let context_messages = payload.len();

        info!(
            source = %request.source_agent,
            target = %request.target_agent,
            depth = chain.depth() + 1,
            policy = ?request.context_policy,
            context_messages,
            "Handing off"
        );

        let call = target.chat(request.prompt.clone(), ChatContext::with_history(payload));
        let response = self.bounded(request, deadline, cancel, call).await?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(target = %request.target_agent, elapsed_ms, "Handoff complete");
        self.publish(WorkflowEvent::HandoffCompleted {
            source: request.source_agent.clone(),
            target: request.target_agent.clone(),
            elapsed_ms,
        });

        Ok(HandoffResult {
            handed_off_to: request.target_agent.clone(),
            response,
            updated_chain: chain.extended(&request.source_agent),
            context_messages,
        })
    }

    /// Await `work` until `deadline`, or until `cancel` fires.
    async fn bounded<T>(
        &self,
        request: &HandoffRequest,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BatonError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(BatonError::HandoffTimeout {
                    timeout_secs: request.timeout_secs,
                    agent: request.target_agent.clone(),
                }),
            },
        }
    }

    /// Build what the target sees according to the request's context policy.
    pub async fn build_payload(
        &self,
        request: &HandoffRequest,
        conversation: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>> {
        let dialogue: Vec<&ChatMessage> = conversation.iter().filter(|m| !m.is_system()).collect();

        Ok(match request.context_policy {
            HandoffContextPolicy::Full => conversation.to_vec(),
            HandoffContextPolicy::None => vec![],
            HandoffContextPolicy::LastN => {
                let skip = dialogue.len().saturating_sub(request.max_context_messages);
                dialogue.into_iter().skip(skip).cloned().collect()
            }
            HandoffContextPolicy::Summary => {
                if dialogue.is_empty() {
                    return Ok(vec![]);
                }
                let summary = match &self.summarizer {
                    Some(summarizer) => {
                        let owned: Vec<ChatMessage> = dialogue.into_iter().cloned().collect();
                        summarizer.summarize(&owned).await?
                    }
                    None => condense(&dialogue, request.max_context_messages),
                };
                vec![ChatMessage::user(format!(
                    "[Handoff summary from {}]\n{}",
                    request.source_agent, summary
                ))
                .with_metadata(MessageMetadata {
                    protected: true,
                    agent: Some(request.source_agent.clone()),
                })]
            }
        })
    }

    fn slot(&self, source: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
            .clone()
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Built-in condensation used when no summarizer is attached: one line per
/// recent message, each clipped to a short snippet.
fn condense(messages: &[&ChatMessage], max_messages: usize) -> String {
    let skip = messages.len().saturating_sub(max_messages.max(1));
    messages
        .iter()
        .skip(skip)
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let snippet: String = m.content.chars().take(SUMMARY_SNIPPET_CHARS).collect();
            if m.content.chars().count() > SUMMARY_SNIPPET_CHARS {
                format!("{}: {}...", role, snippet)
            } else {
                format!("{}: {}", role, snippet)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
