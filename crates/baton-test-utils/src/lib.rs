//! Stub collaborators shared by the Baton test suites.
//!
//! Every stub records its calls so tests can assert on what crossed the
//! collaborator boundary (prompts, visible variables, handoff payloads).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use baton_core::error::{BatonError, Result};
use baton_core::traits::{Chatter, Guardrail, Summarizer, ToolExecutor};
use baton_core::types::{ChatContext, ChatMessage, GuardrailResult};

type Responder = Arc<dyn Fn(&str, &ChatContext) -> Result<String> + Send + Sync>;

/// A recorded agent call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub context: ChatContext,
}

/// Configurable agent stub.
pub struct StubAgent {
    name: String,
    responder: Responder,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubAgent {
    pub fn from_fn(
        name: impl Into<String>,
        f: impl Fn(&str, &ChatContext) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            responder: Arc::new(f),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers with its prompt.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::from_fn(name, |prompt, _| Ok(prompt.to_string()))
    }

    /// Always answers with the same text.
    pub fn fixed(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(name, move |_, _| Ok(text.clone()))
    }

    /// Always fails with an agent call error.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let agent = name.clone();
        Self::from_fn(name, move |_, _| {
            Err(BatonError::AgentCall {
                agent: agent.clone(),
                message: message.clone(),
            })
        })
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Chatter for StubAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat(&self, prompt: String, context: ChatContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(RecordedCall {
                prompt: prompt.clone(),
                context: context.clone(),
            });
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.responder)(&prompt, &context)
        })
    }
}

type ToolResponder =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>, usize) -> Result<serde_json::Value> + Send + Sync>;

/// Configurable tool stub. The responder receives the arguments and the
/// zero-based call number.
pub struct StubTool {
    name: String,
    responder: ToolResponder,
    timeout_secs: u64,
    delay: Option<Duration>,
    calls: Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
}

impl StubTool {
    pub fn from_fn(
        name: impl Into<String>,
        f: impl Fn(&serde_json::Map<String, serde_json::Value>, usize) -> Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            responder: Arc::new(f),
            timeout_secs: 30,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns its arguments as a JSON object.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::from_fn(name, |args, _| Ok(serde_json::Value::Object(args.clone())))
    }

    pub fn fixed(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::from_fn(name, move |_, _| Ok(value.clone()))
    }

    /// Fails with a transient error for the first `failures` calls.
    pub fn flaky(name: impl Into<String>, failures: usize, value: serde_json::Value) -> Self {
        let name = name.into();
        let tool = name.clone();
        Self::from_fn(name, move |_, n| {
            if n < failures {
                Err(BatonError::ToolExecution {
                    tool: tool.clone(),
                    message: "connection reset".into(),
                })
            } else {
                Ok(value.clone())
            }
        })
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ToolExecutor for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(arguments.clone());
                calls.len() - 1
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.responder)(&arguments, n)
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

type Check = Arc<dyn Fn(&serde_json::Value) -> GuardrailResult + Send + Sync>;

/// Configurable guardrail stub.
pub struct StubGuardrail {
    name: String,
    check: Check,
    checks: AtomicUsize,
}

impl StubGuardrail {
    pub fn from_fn(
        name: impl Into<String>,
        f: impl Fn(&serde_json::Value) -> GuardrailResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(f),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn always_pass(name: impl Into<String>) -> Self {
        Self::from_fn(name, |_| GuardrailResult::pass())
    }

    pub fn always_fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(name, move |_| GuardrailResult::fail(message.clone()))
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl Guardrail for StubGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async move {
            self.checks.fetch_add(1, Ordering::SeqCst);
            (self.check)(output)
        })
    }
}

/// Summarizer that returns fixed text and remembers what it was given.
pub struct FixedSummarizer {
    text: String,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FixedSummarizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

impl Summarizer for FixedSummarizer {
    fn summarize<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.text.clone())
        })
    }
}

/// A short conversation used across handoff and budget tests.
pub fn sample_conversation(turns: usize) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system("You are a helpful assistant.")];
    for i in 0..turns {
        messages.push(ChatMessage::user(format!("question {}", i)));
        messages.push(ChatMessage::assistant(format!("answer {}", i)));
    }
    messages
}
