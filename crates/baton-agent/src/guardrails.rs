use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use baton_core::error::{BatonError, Result};
use baton_core::traits::{Chatter, Guardrail};
use baton_core::types::{value_to_text, ChatContext, GuardrailResult};

/// Fails on null, empty or whitespace-only output.
pub struct NonEmptyGuardrail;

impl Guardrail for NonEmptyGuardrail {
    fn name(&self) -> &str {
        "non_empty"
    }

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async move {
            let empty = match output {
                serde_json::Value::Null => true,
                serde_json::Value::Array(items) => items.is_empty(),
                serde_json::Value::Object(map) => map.is_empty(),
                other => value_to_text(other).trim().is_empty(),
            };
            if empty {
                GuardrailResult::fail("Output is empty")
            } else {
                GuardrailResult::pass()
            }
        })
    }
}

/// Fails when the textual output exceeds `max_chars` characters.
pub struct MaxLengthGuardrail {
    name: String,
    max_chars: usize,
}

impl MaxLengthGuardrail {
    pub fn new(name: impl Into<String>, max_chars: usize) -> Self {
        Self {
            name: name.into(),
            max_chars,
        }
    }
}

impl Guardrail for MaxLengthGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async move {
            let len = value_to_text(output).chars().count();
            if len > self.max_chars {
                GuardrailResult::fail(format!(
                    "Output is {} characters, limit is {}. Be more concise.",
                    len, self.max_chars
                ))
            } else {
                GuardrailResult::pass()
            }
        })
    }
}

/// Requires (or forbids) a pattern in the textual output.
pub struct RegexGuardrail {
    name: String,
    pattern: Regex,
    must_match: bool,
}

impl RegexGuardrail {
    /// Output must match `pattern`.
    pub fn require(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::build(name.into(), pattern, true)
    }

    /// Output must not match `pattern`.
    pub fn forbid(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::build(name.into(), pattern, false)
    }

    fn build(name: String, pattern: &str, must_match: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| BatonError::Config(format!("Guardrail '{}' has an invalid pattern: {}", name, e)))?;
        Ok(Self {
            name,
            pattern,
            must_match,
        })
    }
}

impl Guardrail for RegexGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async move {
            let text = value_to_text(output);
            match (self.must_match, self.pattern.is_match(&text)) {
                (true, false) => GuardrailResult::fail(format!(
                    "Output must match /{}/",
                    self.pattern.as_str()
                )),
                (false, true) => GuardrailResult::fail(format!(
                    "Output must not match /{}/",
                    self.pattern.as_str()
                )),
                _ => GuardrailResult::pass(),
            }
        })
    }
}

/// Asks an agent to judge the output against written criteria.
///
/// The judge is expected to answer with a JSON verdict, optionally inside a
/// code fence. Answers that cannot be parsed, and failed judge calls, let
/// the output through rather than blocking the workflow.
pub struct JudgeGuardrail {
    name: String,
    judge: Arc<dyn Chatter>,
    criteria: String,
}

impl JudgeGuardrail {
    pub fn new(name: impl Into<String>, judge: Arc<dyn Chatter>, criteria: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            judge,
            criteria: criteria.into(),
        }
    }

    fn prompt(&self, output: &str) -> String {
        format!(
            r#"You are a judge reviewing the output of an automated step.

Criteria:
{}

Output:
{}

Respond with ONLY valid JSON:
{{
  "verdict": "pass" | "fail",
  "reason": "brief explanation",
  "hint": "what to change (only if verdict is fail)"
}}"#,
            self.criteria, output
        )
    }
}

impl Guardrail for JudgeGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check<'a>(&'a self, output: &'a serde_json::Value) -> BoxFuture<'a, GuardrailResult> {
        Box::pin(async move {
            let prompt = self.prompt(&value_to_text(output));
            match self.judge.chat(prompt, ChatContext::default()).await {
                Ok(response) => parse_verdict(&response),
                Err(e) => {
                    warn!(guardrail = %self.name, error = %e, "Judge call failed, letting output through");
                    GuardrailResult::pass()
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct JudgeResponse {
    verdict: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    hint: String,
}

fn parse_verdict(response: &str) -> GuardrailResult {
    let json_str = extract_json(response);

    match serde_json::from_str::<JudgeResponse>(json_str) {
        Ok(resp) => match resp.verdict.to_lowercase().as_str() {
            "pass" | "accept" => GuardrailResult::pass(),
            "fail" | "retry" | "reject" => {
                let mut message = if resp.reason.is_empty() {
                    "Judge rejected the output".to_string()
                } else {
                    resp.reason
                };
                if !resp.hint.is_empty() {
                    message = format!("{} Hint: {}", message, resp.hint);
                }
                GuardrailResult::fail(message)
            }
            other => {
                warn!(verdict = %other, "Unknown verdict from judge, treating as pass");
                GuardrailResult::pass()
            }
        },
        Err(e) => {
            warn!(error = %e, response = %response, "Failed to parse judge response");
            GuardrailResult::pass()
        }
    }
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                return after[..end].trim();
            }
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
