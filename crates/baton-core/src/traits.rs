use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Agent collaborator — anything that can answer a prompt.
pub trait Chatter: Send + Sync + 'static {
    /// Agent name (used in handoff chains and logs).
    fn name(&self) -> &str;

    /// Answer a prompt given the visible context.
    fn chat(&self, prompt: String, context: ChatContext) -> BoxFuture<'_, Result<String>>;

    /// Run a task. Defaults to chatting with the task description.
    fn execute(&self, task: AgentTask, context: ChatContext) -> BoxFuture<'_, Result<TaskOutput>> {
        Box::pin(async move {
            let raw = self.chat(task.description, context).await?;
            let structured = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .filter(|v| v.is_object());
            Ok(TaskOutput {
                agent: self.name().to_string(),
                raw,
                structured,
            })
        })
    }
}

/// Tool collaborator — executes with rendered arguments.
pub trait ToolExecutor: Send + Sync + 'static {
    /// Tool name (used in step references).
    fn name(&self) -> &str;

    /// Execute the tool.
    fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Post-hoc quality check on step output.
pub trait Guardrail: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult>;
}

/// Condenses a conversation for the `summary` handoff policy.
pub trait Summarizer: Send + Sync + 'static {
    fn summarize<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(&'static str);

    impl Chatter for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn chat(&self, prompt: String, _context: ChatContext) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                assert_eq!(prompt, "write the outline");
                Ok(self.0.to_string())
            })
        }
    }

    fn task() -> AgentTask {
        AgentTask {
            description: "write the outline".into(),
            expected_output: None,
        }
    }

    #[tokio::test]
    async fn test_execute_plain_text() {
        let out = Canned("1. intro").execute(task(), ChatContext::default()).await.unwrap();
        assert_eq!(out.agent, "canned");
        assert_eq!(out.raw, "1. intro");
        assert!(out.structured.is_none());
    }

    #[tokio::test]
    async fn test_execute_parses_json_object() {
        let out = Canned(r#"{"sections": 3}"#)
            .execute(task(), ChatContext::default())
            .await
            .unwrap();
        assert_eq!(out.structured, Some(serde_json::json!({"sections": 3})));

        // Only objects count as structured output.
        let out = Canned("[1, 2]").execute(task(), ChatContext::default()).await.unwrap();
        assert!(out.structured.is_none());
    }
}
