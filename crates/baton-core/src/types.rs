use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Per-message flags consulted by budget truncation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Never dropped by truncation.
    #[serde(default)]
    pub protected: bool,
    /// Agent that authored the message, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// A chat message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn protected(self) -> Self {
        let mut metadata = self.metadata.clone().unwrap_or_default();
        metadata.protected = true;
        self.with_metadata(metadata)
    }

    pub fn is_protected(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.protected)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Output of a tool call headed for a model, budgeted per tool channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    pub tool_name: String,
    pub content: String,
}

impl ToolOutput {
    pub fn new(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            content: content.into(),
        }
    }
}

/// What an agent sees alongside its prompt.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    /// Conversation carried into the call (handoff payloads, budgeted history).
    pub history: Vec<ChatMessage>,
    /// Workflow variables visible under the step's context policy.
    pub variables: HashMap<String, serde_json::Value>,
}

impl ChatContext {
    pub fn with_history(history: Vec<ChatMessage>) -> Self {
        Self {
            history,
            variables: HashMap::new(),
        }
    }

    pub fn with_variables(variables: HashMap<String, serde_json::Value>) -> Self {
        Self {
            history: vec![],
            variables,
        }
    }
}

/// A unit of work handed to an agent's `execute` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub description: String,
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Result of `Chatter::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub agent: String,
    pub raw: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
}

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub passed: bool,
    pub message: String,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Render a JSON value as prompt text: strings verbatim, everything else as JSON.
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_flag() {
        let msg = ChatMessage::user("keep me").protected();
        assert!(msg.is_protected());
        assert!(!ChatMessage::user("drop me").is_protected());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&serde_json::json!("hi")), "hi");
        assert_eq!(value_to_text(&serde_json::json!(3)), "3");
        assert_eq!(value_to_text(&serde_json::json!(["a"])), r#"["a"]"#);
        assert_eq!(value_to_text(&serde_json::Value::Null), "");
    }

    #[test]
    fn test_message_serialization_roundtrip() {
        let msg = ChatMessage::assistant("done");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.role, Role::Assistant);
        assert_eq!(parsed.content, "done");
    }
}
