use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use baton_core::config::RetryConfig;
use baton_core::error::{BatonError, Result};
use baton_core::event::{emit, EventBus, WorkflowEvent};
use baton_core::traits::Guardrail;
use baton_core::types::RunId;

use crate::definition::{OnError, Step};
use crate::resolver::Resolution;
use crate::result::StepResult;

/// What the resolver is told about the attempt it is making.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    /// Guardrail message that rejected the previous attempt.
    pub feedback: Option<String>,
}

/// Final outcome after retries, before on-error dispatch.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub value: Result<serde_json::Value>,
    /// Writes of the last attempt.
    pub writes: Vec<(String, serde_json::Value)>,
    pub children: Vec<StepResult>,
    pub attempts: u32,
}

/// Wraps a resolver call with guardrail checks and a bounded retry loop.
pub struct RetryGuardrailController<'a> {
    retry: &'a RetryConfig,
    run_id: &'a RunId,
    cancel: &'a CancellationToken,
    guardrails: Vec<Arc<dyn Guardrail>>,
    event_bus: Option<&'a Arc<EventBus>>,
}

impl<'a> RetryGuardrailController<'a> {
    pub fn new(retry: &'a RetryConfig, run_id: &'a RunId, cancel: &'a CancellationToken) -> Self {
        Self {
            retry,
            run_id,
            cancel,
            guardrails: vec![],
            event_bus: None,
        }
    }

    pub fn with_guardrails(mut self, guardrails: Vec<Arc<dyn Guardrail>>) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Option<&'a Arc<EventBus>>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Retry budget for `step`: its own `max_retries`, else the configured
    /// default for `on_error = retry` steps, else none.
    pub fn max_retries_for(&self, step: &Step) -> u32 {
        step.max_retries.unwrap_or(if step.on_error == OnError::Retry {
            self.retry.max_retries
        } else {
            0
        })
    }

    /// Run `invoke` until its value passes every guardrail, the error is not
    /// worth retrying, or the retry budget is spent.
    pub async fn attempt<F, Fut>(&self, step: &Step, mut invoke: F) -> AttemptOutcome
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Resolution>,
    {
        let max_retries = self.max_retries_for(step);
        let mut number = 0u32;
        let mut feedback = None;

        loop {
            number += 1;
            let resolution = invoke(Attempt {
                number,
                feedback: feedback.take(),
            })
            .await;
            let Resolution {
                value,
                writes,
                children,
            } = resolution;

            let reason = match value {
                Ok(value) => match self.check(step, &value).await {
                    None => {
                        return AttemptOutcome {
                            value: Ok(value),
                            writes,
                            children,
                            attempts: number,
                        }
                    }
                    Some(message) => {
                        if number > max_retries {
                            return AttemptOutcome {
                                value: Err(BatonError::GuardrailExhausted {
                                    attempts: number,
                                    message,
                                }),
                                writes,
                                children,
                                attempts: number,
                            };
                        }
                        feedback = Some(message.clone());
                        message
                    }
                },
                Err(e) => {
                    let retryable = !e.is_structural()
                        && (e.is_transient() || step.on_error == OnError::Retry);
                    if !retryable || number > max_retries {
                        return AttemptOutcome {
                            value: Err(e),
                            writes,
                            children,
                            attempts: number,
                        };
                    }
                    e.to_string()
                }
            };

            warn!(step = %step.name, attempt = number, max_retries, reason = %reason, "Retrying step");
            emit(
                self.event_bus,
                WorkflowEvent::StepRetrying {
                    run_id: self.run_id.clone(),
                    step: step.name.clone(),
                    attempt: number + 1,
                    reason,
                },
            );

            if let Err(e) = self.pause(number).await {
                return AttemptOutcome {
                    value: Err(e),
                    writes: vec![],
                    children: vec![],
                    attempts: number,
                };
            }
        }
    }

    /// First guardrail failure message, if any.
    async fn check(&self, step: &Step, value: &serde_json::Value) -> Option<String> {
        for guardrail in &self.guardrails {
            let result = guardrail.check(value).await;
            if !result.passed {
                debug!(step = %step.name, guardrail = %guardrail.name(), message = %result.message, "Guardrail failed");
                emit(
                    self.event_bus,
                    WorkflowEvent::GuardrailFailed {
                        run_id: self.run_id.clone(),
                        step: step.name.clone(),
                        guardrail: guardrail.name().to_string(),
                        message: result.message.clone(),
                    },
                );
                return Some(if result.message.is_empty() {
                    format!("rejected by guardrail '{}'", guardrail.name())
                } else {
                    result.message
                });
            }
        }
        None
    }

    async fn pause(&self, attempt: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BatonError::Cancelled);
        }
        if !self.retry.backoff {
            return Ok(());
        }
        let delay = calculate_backoff(attempt - 1, self.retry);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BatonError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Exponential backoff with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use baton_test_utils::StubGuardrail;
    use serde_json::json;

    use crate::definition::Step;

    fn no_backoff() -> RetryConfig {
        RetryConfig {
            backoff: false,
            ..RetryConfig::default()
        }
    }

    fn ok(value: serde_json::Value) -> Resolution {
        Resolution::ok(value)
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::agent("s", "a", "p");
        let outcome = ctl.attempt(&step, |_| async { ok(json!("fine")) }).await;
        assert_eq!(outcome.value.unwrap(), json!("fine"));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_guardrail_exhausted_after_max_retries() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let guardrail = Arc::new(StubGuardrail::always_fail("strict", "too vague"));
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel)
            .with_guardrails(vec![guardrail.clone() as Arc<dyn Guardrail>]);
        let step = Step::agent("s", "a", "p").with_max_retries(2);
        let calls = AtomicU32::new(0);

        let outcome = ctl
            .attempt(&step, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { ok(json!("meh")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(guardrail.check_count(), 3);
        match outcome.value.unwrap_err() {
            BatonError::GuardrailExhausted { attempts, message } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "too vague");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_feedback_passed_to_next_attempt() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let guardrail = Arc::new(StubGuardrail::from_fn("len", |v| {
            if v.as_str().is_some_and(|s| s.len() > 3) {
                baton_core::types::GuardrailResult::pass()
            } else {
                baton_core::types::GuardrailResult::fail("too short")
            }
        }));
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel).with_guardrails(vec![guardrail as Arc<dyn Guardrail>]);
        let step = Step::agent("s", "a", "p").with_max_retries(1);

        let outcome = ctl
            .attempt(&step, |attempt| async move {
                match attempt.feedback {
                    None => ok(json!("no")),
                    Some(fb) => ok(json!(format!("fixed: {}", fb))),
                }
            })
            .await;
        assert_eq!(outcome.value.unwrap(), json!("fixed: too short"));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_error_retried_without_retry_policy() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::tool("t", "x", Default::default()).with_max_retries(2);

        let outcome = ctl
            .attempt(&step, |attempt| async move {
                if attempt.number < 3 {
                    Resolution::err(BatonError::ToolTimeout {
                        tool: "x".into(),
                        timeout_secs: 1,
                    })
                } else {
                    ok(json!(1))
                }
            })
            .await;
        assert_eq!(outcome.value.unwrap(), json!(1));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried_under_stop() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::agent("s", "a", "p").with_max_retries(5);

        let outcome = ctl
            .attempt(&step, |_| async {
                Resolution::err(BatonError::AgentCall {
                    agent: "a".into(),
                    message: "bad request".into(),
                })
            })
            .await;
        assert!(outcome.value.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_uses_config_default() {
        let config = RetryConfig {
            max_retries: 2,
            backoff: false,
            ..RetryConfig::default()
        };
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::agent("s", "a", "p").with_on_error(OnError::Retry);
        assert_eq!(ctl.max_retries_for(&step), 2);

        let outcome = ctl
            .attempt(&step, |_| async {
                Resolution::err(BatonError::AgentCall {
                    agent: "a".into(),
                    message: "bad request".into(),
                })
            })
            .await;
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_structural_error_never_retried() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::agent("s", "a", "p")
            .with_on_error(OnError::Retry)
            .with_max_retries(3);

        let outcome = ctl
            .attempt(&step, |_| async {
                Resolution::err(BatonError::HandoffCycle {
                    chain: vec!["a".into(), "b".into(), "a".into()],
                })
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.value, Err(BatonError::HandoffCycle { .. })));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let config = RetryConfig {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            ..RetryConfig::default()
        };
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel);
        let step = Step::agent("s", "a", "p").with_max_retries(3);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = ctl
            .attempt(&step, |_| async {
                Resolution::err(BatonError::AgentTimeout {
                    agent: "a".into(),
                    timeout_secs: 1,
                })
            })
            .await;
        assert!(matches!(outcome.value, Err(BatonError::Cancelled)));
    }

    #[tokio::test]
    async fn test_events() {
        let config = no_backoff();
        let (run_id, cancel) = (RunId::new(), CancellationToken::new());
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let ctl = RetryGuardrailController::new(&config, &run_id, &cancel)
            .with_guardrails(vec![Arc::new(StubGuardrail::always_fail("g", "nope")) as Arc<dyn Guardrail>])
            .with_event_bus(Some(&bus));
        let step = Step::agent("s", "a", "p").with_max_retries(1);
        ctl.attempt(&step, |_| async { ok(json!("x")) }).await;

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["guardrail_failed", "step_retrying", "guardrail_failed"]);
    }

    #[test]
    fn test_backoff_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..10 {
            let d = calculate_backoff(attempt, &config);
            assert!(d <= Duration::from_millis((config.max_backoff_ms as f64 * 1.2) as u64));
        }
        let first = calculate_backoff(0, &config);
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));
    }
}
