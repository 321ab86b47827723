use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, BatonError};

/// Top-level Baton configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Concurrency for parallel loops that omit `max_workers`.
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
    /// Deadline for a single agent or tool call.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Cancel in-flight siblings when a fan-out child fails fatally.
    /// When false, in-flight siblings finish but no new ones start.
    #[serde(default)]
    pub cancel_siblings_on_failure: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_max_workers: default_max_workers(),
            step_timeout_secs: default_step_timeout(),
            cancel_siblings_on_failure: false,
        }
    }
}

fn default_max_workers() -> usize { 4 }
fn default_step_timeout() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget for `on_error = retry` steps that omit `max_retries`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Sleep with exponential backoff between attempts.
    #[serde(default = "default_backoff")]
    pub backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff: default_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10000 }
fn default_backoff() -> bool { true }

/// How much conversation history crosses a handoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffContextPolicy {
    Full,
    #[default]
    Summary,
    None,
    LastN,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_handoff_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_detect_cycles")]
    pub detect_cycles: bool,
    #[serde(default)]
    pub context_policy: HandoffContextPolicy,
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// In-flight handoffs allowed per source agent.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            timeout_secs: default_handoff_timeout(),
            detect_cycles: default_detect_cycles(),
            context_policy: HandoffContextPolicy::default(),
            max_context_messages: default_max_context_messages(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_depth() -> usize { 5 }
fn default_handoff_timeout() -> u64 { 300 }
fn default_detect_cycles() -> bool { true }
fn default_max_context_messages() -> usize { 10 }
fn default_max_concurrent() -> usize { 3 }

/// Token estimator selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    #[default]
    Chars,
    Bpe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: usize,
    /// Budget for the system channel (informational; the channel is protected).
    #[serde(default)]
    pub system_tokens: Option<usize>,
    #[serde(default = "default_history_tokens")]
    pub history_tokens: usize,
    /// Default budget of every tool channel.
    #[serde(default = "default_tool_tokens")]
    pub tool_tokens: usize,
    /// Per-tool overrides, keyed by tool name.
    #[serde(default)]
    pub tools: HashMap<String, usize>,
    /// Additional channels that are never truncated.
    #[serde(default)]
    pub protected: Vec<String>,
    #[serde(default)]
    pub estimator: EstimatorKind,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_tokens: default_max_total_tokens(),
            system_tokens: None,
            history_tokens: default_history_tokens(),
            tool_tokens: default_tool_tokens(),
            tools: HashMap::new(),
            protected: vec![],
            estimator: EstimatorKind::default(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_max_total_tokens() -> usize { 8000 }
fn default_history_tokens() -> usize { 4000 }
fn default_tool_tokens() -> usize { 1000 }
fn default_chars_per_token() -> usize { 3 }

/// Shell commands run by the CLI on workflow events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_workflow_start: Vec<String>,
    #[serde(default)]
    pub on_step_complete: Vec<String>,
    #[serde(default)]
    pub on_workflow_complete: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_workflow_start.is_empty()
            && self.on_step_complete.is_empty()
            && self.on_workflow_complete.is_empty()
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BatonError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);
        debug!(path = %path.display(), "Loaded config file");

        toml::from_str(&expanded).map_err(|e| BatonError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
