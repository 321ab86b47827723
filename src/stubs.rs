//! Offline collaborators for `baton dry-run`.

use futures::future::BoxFuture;

use baton_core::error::Result;
use baton_core::traits::{Chatter, Guardrail, ToolExecutor};
use baton_core::types::{ChatContext, GuardrailResult};

/// Answers every prompt with the prompt itself, tagged with its name.
pub struct EchoAgent {
    name: String,
}

impl EchoAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Chatter for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat(&self, prompt: String, context: ChatContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if context.history.is_empty() {
                Ok(format!("[{}] {}", self.name, prompt))
            } else {
                Ok(format!("[{} +{} msgs] {}", self.name, context.history.len(), prompt))
            }
        })
    }
}

/// Returns its rendered arguments.
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ToolExecutor for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(serde_json::Value::Object(arguments)) })
    }
}

/// Stands in for guardrails that need a live model.
pub struct PassGuardrail {
    name: String,
}

impl PassGuardrail {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Guardrail for PassGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check<'a>(&'a self, _output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async { GuardrailResult::pass() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::types::ChatMessage;

    #[tokio::test]
    async fn test_echo_agent() {
        let agent = EchoAgent::new("writer");
        let out = agent.chat("hi".into(), ChatContext::default()).await.unwrap();
        assert_eq!(out, "[writer] hi");
        let out = agent
            .chat("next".into(), ChatContext::with_history(vec![ChatMessage::user("x")]))
            .await
            .unwrap();
        assert_eq!(out, "[writer +1 msgs] next");
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let tool = EchoTool::new("stamp");
        let mut args = serde_json::Map::new();
        args.insert("text".into(), serde_json::json!("hello"));
        let out = tool.execute(args).await.unwrap();
        assert_eq!(out, serde_json::json!({"text": "hello"}));
    }
}
