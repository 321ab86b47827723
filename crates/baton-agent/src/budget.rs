//! Context budgets — bound what a single model call receives.
//!
//! Content is split into channels: the `system` channel (every system-role
//! message, always protected), the `history` channel (every other message),
//! and one `tool:<name>` channel per tool output. Each channel may carry its
//! own token budget, and the whole payload is bounded by `max_total_tokens`.
//!
//! Truncation never removes a protected channel or a protected message, and
//! always keeps the most recent history message (hard-truncated with a
//! `[truncated]` marker when it alone is too large).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use baton_core::config::BudgetConfig;
use baton_core::event::{EventBus, WorkflowEvent};
use baton_core::types::{ChatMessage, ToolOutput};

use crate::tokens::{truncate_to_tokens, TokenEstimator};

pub const SYSTEM_CHANNEL: &str = "system";
pub const HISTORY_CHANNEL: &str = "history";

/// Channel name for a tool's output.
pub fn tool_channel(tool_name: &str) -> String {
    format!("tool:{}", tool_name)
}

/// Token allowances for one agent or session.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    max_total_tokens: usize,
    per_channel_budget: HashMap<String, usize>,
    protected_channels: HashSet<String>,
    default_tool_tokens: Option<usize>,
}

impl ContextBudget {
    pub fn new(max_total_tokens: usize) -> Self {
        let mut protected_channels = HashSet::new();
        protected_channels.insert(SYSTEM_CHANNEL.to_string());
        Self {
            max_total_tokens,
            per_channel_budget: HashMap::new(),
            protected_channels,
            default_tool_tokens: None,
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        let mut budget = Self::new(config.max_total_tokens);
        budget.set_budget(HISTORY_CHANNEL, config.history_tokens);
        if let Some(system) = config.system_tokens {
            budget.set_budget(SYSTEM_CHANNEL, system);
        }
        budget.default_tool_tokens = Some(config.tool_tokens);
        for (tool, tokens) in &config.tools {
            budget.set_budget(tool_channel(tool), *tokens);
        }
        for channel in &config.protected {
            budget.protect(channel.clone());
        }
        budget
    }

    /// Set (or replace) the budget of one channel.
    pub fn set_budget(&mut self, channel: impl Into<String>, max_tokens: usize) {
        self.per_channel_budget.insert(channel.into(), max_tokens);
    }

    /// Budget applied to tool channels without an explicit entry.
    pub fn set_default_tool_budget(&mut self, max_tokens: usize) {
        self.default_tool_tokens = Some(max_tokens);
    }

    pub fn protect(&mut self, channel: impl Into<String>) {
        self.protected_channels.insert(channel.into());
    }

    pub fn max_total_tokens(&self) -> usize {
        self.max_total_tokens
    }

    pub fn channel_budget(&self, channel: &str) -> Option<usize> {
        self.per_channel_budget.get(channel).copied().or_else(|| {
            if channel.starts_with("tool:") {
                self.default_tool_tokens
            } else {
                None
            }
        })
    }

    pub fn is_protected(&self, channel: &str) -> bool {
        channel == SYSTEM_CHANNEL || self.protected_channels.contains(channel)
    }
}

/// What one truncation pass did to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationReport {
    pub channel: String,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub removed_messages: usize,
}

/// Output of [`ContextBudgetManager::truncate`].
#[derive(Debug, Clone)]
pub struct Truncated {
    pub messages: Vec<ChatMessage>,
    pub tool_outputs: Vec<ToolOutput>,
    pub reports: Vec<TruncationReport>,
}

/// Internal signal: the payload does not fit yet.
enum BudgetState {
    Within,
    Exceeded { over_by: usize },
}

/// Applies a [`ContextBudget`] to outgoing messages and tool outputs.
pub struct ContextBudgetManager {
    budget: ContextBudget,
    estimator: Arc<dyn TokenEstimator>,
    event_bus: Option<Arc<EventBus>>,
}

impl ContextBudgetManager {
    pub fn new(budget: ContextBudget, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            budget,
            estimator,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn set_budget(&mut self, channel: impl Into<String>, max_tokens: usize) {
        self.budget.set_budget(channel, max_tokens);
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn message_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.estimator.estimate_message(m)).sum()
    }

    pub fn tool_tokens(&self, outputs: &[ToolOutput]) -> usize {
        outputs.iter().map(|o| self.estimator.estimate(&o.content)).sum()
    }

    fn history_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .filter(|m| !m.is_system())
            .map(|m| self.estimator.estimate_message(m))
            .sum()
    }

    fn state(&self, messages: &[ChatMessage], outputs: &[ToolOutput]) -> BudgetState {
        let total = self.message_tokens(messages) + self.tool_tokens(outputs);
        if total <= self.budget.max_total_tokens {
            BudgetState::Within
        } else {
            BudgetState::Exceeded {
                over_by: total - self.budget.max_total_tokens,
            }
        }
    }

    /// Fit messages and tool outputs into the budget.
    pub fn truncate(&self, messages: &[ChatMessage], tool_outputs: &[ToolOutput]) -> Truncated {
        let mut messages = messages.to_vec();
        let mut outputs = tool_outputs.to_vec();
        let mut reports = Vec::new();

        // Per-channel pass: history
        if !self.budget.is_protected(HISTORY_CHANNEL) {
            if let Some(limit) = self.budget.channel_budget(HISTORY_CHANNEL) {
                let before = self.history_tokens(&messages);
                if before > limit {
                    let removed = self.drop_oldest(&mut messages, limit, |m| self.history_tokens(m));
                    let over = self.history_tokens(&messages).saturating_sub(limit);
                    if over > 0 {
                        self.shrink_latest(&mut messages, over);
                    }
                    reports.push(TruncationReport {
                        channel: HISTORY_CHANNEL.to_string(),
                        tokens_before: before,
                        tokens_after: self.history_tokens(&messages),
                        removed_messages: removed,
                    });
                }
            }
        }

        // Per-channel pass: tool outputs
        for output in outputs.iter_mut() {
            let channel = tool_channel(&output.tool_name);
            if self.budget.is_protected(&channel) {
                continue;
            }
            if let Some(limit) = self.budget.channel_budget(&channel) {
                let before = self.estimator.estimate(&output.content);
                if before > limit {
                    output.content = truncate_to_tokens(self.estimator.as_ref(), &output.content, limit);
                    reports.push(TruncationReport {
                        channel,
                        tokens_before: before,
                        tokens_after: self.estimator.estimate(&output.content),
                        removed_messages: 0,
                    });
                }
            }
        }

        // Total pass
        if let BudgetState::Exceeded { over_by } = self.state(&messages, &outputs) {
            debug!(over_by, "Context over total budget after per-channel truncation");
            let before = self.message_tokens(&messages);
            let target = self
                .budget
                .max_total_tokens
                .saturating_sub(self.tool_tokens(&outputs));
            let kept = self.emergency_truncate(&messages, target);
            let removed = messages.len() - kept.len();
            messages = kept;

            if let BudgetState::Exceeded { .. } = self.state(&messages, &outputs) {
                self.shrink_tool_outputs(&mut outputs, &messages, &mut reports);
            }
            if let BudgetState::Exceeded { over_by } = self.state(&messages, &outputs) {
                self.shrink_latest(&mut messages, over_by);
            }

            let after = self.message_tokens(&messages);
            if after != before {
                reports.push(TruncationReport {
                    channel: "total".to_string(),
                    tokens_before: before,
                    tokens_after: after,
                    removed_messages: removed,
                });
            }
            if let BudgetState::Exceeded { over_by } = self.state(&messages, &outputs) {
                warn!(over_by, "Protected content alone exceeds the total budget");
            }
        }

        for report in &reports {
            debug!(
                channel = %report.channel,
                before = report.tokens_before,
                after = report.tokens_after,
                removed = report.removed_messages,
                "Truncation applied"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(WorkflowEvent::TruncationApplied {
                    channel: report.channel.clone(),
                    tokens_before: report.tokens_before,
                    tokens_after: report.tokens_after,
                    removed_messages: report.removed_messages,
                });
            }
        }

        Truncated {
            messages,
            tool_outputs: outputs,
            reports,
        }
    }

    /// Drop whole messages from the oldest non-protected end until the
    /// messages fit `target_tokens`, or only protected messages and the latest
    /// history message remain.
    pub fn emergency_truncate(&self, messages: &[ChatMessage], target_tokens: usize) -> Vec<ChatMessage> {
        let mut kept = messages.to_vec();
        self.drop_oldest(&mut kept, target_tokens, |m| self.message_tokens(m));
        kept
    }

    /// Remove droppable messages oldest-first while `measure` exceeds `limit`.
    /// Returns the number of messages removed.
    fn drop_oldest(
        &self,
        messages: &mut Vec<ChatMessage>,
        limit: usize,
        measure: impl Fn(&[ChatMessage]) -> usize,
    ) -> usize {
        if self.budget.is_protected(HISTORY_CHANNEL) {
            return 0;
        }
        let mut removed = 0;
        while measure(messages.as_slice()) > limit {
            let latest = latest_history_index(messages);
            let remove_idx = (0..messages.len())
                .find(|&idx| Some(idx) != latest && !messages[idx].is_system() && !messages[idx].is_protected());
            match remove_idx {
                Some(idx) => {
                    messages.remove(idx);
                    removed += 1;
                }
                None => break,
            }
        }
        removed
    }

    /// Hard-truncate the latest history message so it sheds `over_by` tokens.
    fn shrink_latest(&self, messages: &mut [ChatMessage], over_by: usize) {
        if self.budget.is_protected(HISTORY_CHANNEL) {
            return;
        }
        let Some(idx) = latest_history_index(messages) else {
            return;
        };
        if messages[idx].is_protected() {
            return;
        }
        let current = self.estimator.estimate(&messages[idx].content);
        let allowance = current.saturating_sub(over_by);
        messages[idx].content = truncate_to_tokens(self.estimator.as_ref(), &messages[idx].content, allowance);
    }

    /// Share the remaining allowance evenly between unprotected tool outputs.
    fn shrink_tool_outputs(
        &self,
        outputs: &mut [ToolOutput],
        messages: &[ChatMessage],
        reports: &mut Vec<TruncationReport>,
    ) {
        let protected_tokens: usize = outputs
            .iter()
            .filter(|o| self.budget.is_protected(&tool_channel(&o.tool_name)))
            .map(|o| self.estimator.estimate(&o.content))
            .sum();
        let shrinkable = outputs
            .iter()
            .filter(|o| !self.budget.is_protected(&tool_channel(&o.tool_name)))
            .count();
        if shrinkable == 0 {
            return;
        }
        let allowance = self
            .budget
            .max_total_tokens
            .saturating_sub(self.message_tokens(messages) + protected_tokens);
        let share = allowance / shrinkable;

        for output in outputs.iter_mut() {
            let channel = tool_channel(&output.tool_name);
            if self.budget.is_protected(&channel) {
                continue;
            }
            let before = self.estimator.estimate(&output.content);
            if before > share {
                output.content = if share == 0 {
                    String::new()
                } else {
                    truncate_to_tokens(self.estimator.as_ref(), &output.content, share)
                };
                reports.push(TruncationReport {
                    channel,
                    tokens_before: before,
                    tokens_after: self.estimator.estimate(&output.content),
                    removed_messages: 0,
                });
            }
        }
    }
}

fn latest_history_index(messages: &[ChatMessage]) -> Option<usize> {
    messages.iter().rposition(|m| !m.is_system())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{CharEstimator, MESSAGE_OVERHEAD, TRUNCATION_MARKER};
    use baton_core::types::Role;

    fn manager(budget: ContextBudget) -> ContextBudgetManager {
        ContextBudgetManager::new(budget, Arc::new(CharEstimator::new(1)))
    }

    /// A message whose estimate (content + overhead) is exactly `tokens`.
    fn sized(role: Role, tokens: usize, tag: char) -> ChatMessage {
        ChatMessage::new(role, tag.to_string().repeat(tokens - MESSAGE_OVERHEAD))
    }

    #[test]
    fn test_within_budget_untouched() {
        let mgr = manager(ContextBudget::new(1000));
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let out = mgr.truncate(&messages, &[]);
        assert_eq!(out.messages, messages);
        assert!(out.reports.is_empty());
    }

    #[test]
    fn test_total_budget_keeps_system_and_latest() {
        // system = 30 tokens, history = 10 messages of 20 tokens = 200 tokens
        let mgr = manager(ContextBudget::new(100));
        let system = sized(Role::System, 30, 's');
        let mut messages = vec![system.clone()];
        for i in 0..10 {
            let tag = char::from(b'a' + i as u8);
            messages.push(sized(Role::User, 20, tag));
        }
        let latest = messages.last().unwrap().clone();

        let out = mgr.truncate(&messages, &[]);
        assert!(mgr.message_tokens(&out.messages) <= 100);
        assert_eq!(out.messages[0], system);
        assert_eq!(out.messages.last().unwrap().content, latest.content);
        assert!(!out.reports.is_empty());
    }

    #[test]
    fn test_oversized_latest_is_char_truncated() {
        let mgr = manager(ContextBudget::new(100));
        let system = sized(Role::System, 30, 's');
        let latest = sized(Role::User, 200, 'z');
        let messages = vec![system.clone(), ChatMessage::user("older"), latest];

        let out = mgr.truncate(&messages, &[]);
        assert!(mgr.message_tokens(&out.messages) <= 100);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0], system);
        assert!(out.messages[1].content.starts_with('z'));
        assert!(out.messages[1].content.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_history_channel_budget() {
        let mut budget = ContextBudget::new(10_000);
        budget.set_budget(HISTORY_CHANNEL, 50);
        let mgr = manager(budget);
        let mut messages = vec![ChatMessage::system("sys")];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!("message number {}", i)));
        }

        let out = mgr.truncate(&messages, &[]);
        assert!(mgr.history_tokens(&out.messages) <= 50);
        assert_eq!(out.messages[0].content, "sys");
        assert_eq!(out.messages.last().unwrap().content, "message number 9");
        assert_eq!(out.reports[0].channel, HISTORY_CHANNEL);
        assert!(out.reports[0].removed_messages > 0);
    }

    #[test]
    fn test_protected_messages_survive() {
        let mut budget = ContextBudget::new(10_000);
        budget.set_budget(HISTORY_CHANNEL, 40);
        let mgr = manager(budget);
        let mut messages = vec![ChatMessage::user("pinned fact").protected()];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!("chatter {}", i)));
        }

        let out = mgr.truncate(&messages, &[]);
        assert!(out.messages.iter().any(|m| m.content == "pinned fact"));
        assert_eq!(out.messages.last().unwrap().content, "chatter 9");
    }

    #[test]
    fn test_protected_history_channel_untouched() {
        let mut budget = ContextBudget::new(10_000);
        budget.set_budget(HISTORY_CHANNEL, 10);
        budget.protect(HISTORY_CHANNEL);
        let mgr = manager(budget);
        let messages: Vec<_> = (0..5).map(|i| ChatMessage::user(format!("m{}", i))).collect();
        let out = mgr.truncate(&messages, &[]);
        assert_eq!(out.messages.len(), 5);
    }

    #[test]
    fn test_protected_history_survives_total_budget() {
        let mut budget = ContextBudget::new(50);
        budget.protect(HISTORY_CHANNEL);
        let mgr = manager(budget);
        let messages: Vec<_> = (0..10).map(|i| ChatMessage::user(format!("fact {}", i))).collect();

        let out = mgr.truncate(&messages, &[]);
        assert_eq!(out.messages, messages);
        assert!(out.reports.is_empty());
        assert_eq!(mgr.emergency_truncate(&messages, 0).len(), 10);
    }

    #[test]
    fn test_protected_history_leaves_tools_to_shrink() {
        let mut budget = ContextBudget::new(60);
        budget.protect(HISTORY_CHANNEL);
        let mgr = manager(budget);
        let messages = vec![sized(Role::User, 20, 'u'), sized(Role::Assistant, 20, 'a')];
        let outputs = vec![ToolOutput::new("search", "r".repeat(100))];

        let out = mgr.truncate(&messages, &outputs);
        assert_eq!(out.messages, messages);
        assert!(mgr.estimator().estimate(&out.tool_outputs[0].content) <= 20);
    }

    #[test]
    fn test_tool_channel_budget() {
        let mut budget = ContextBudget::new(10_000);
        budget.set_budget(tool_channel("search"), 20);
        let mgr = manager(budget);
        let outputs = vec![
            ToolOutput::new("search", "r".repeat(100)),
            ToolOutput::new("calc", "42"),
        ];
        let out = mgr.truncate(&[], &outputs);
        assert!(mgr.estimator().estimate(&out.tool_outputs[0].content) <= 20);
        assert!(out.tool_outputs[0].content.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.tool_outputs[1].content, "42");
    }

    #[test]
    fn test_default_tool_budget_and_protection() {
        let mut budget = ContextBudget::new(10_000);
        budget.set_default_tool_budget(15);
        budget.protect(tool_channel("spec"));
        let mgr = manager(budget);
        let outputs = vec![
            ToolOutput::new("spec", "k".repeat(100)),
            ToolOutput::new("grep", "g".repeat(100)),
        ];
        let out = mgr.truncate(&[], &outputs);
        assert_eq!(out.tool_outputs[0].content.len(), 100);
        assert!(mgr.estimator().estimate(&out.tool_outputs[1].content) <= 15);
    }

    #[test]
    fn test_tool_outputs_shrunk_for_total() {
        let mgr = manager(ContextBudget::new(100));
        let messages = vec![sized(Role::System, 30, 's'), sized(Role::User, 10, 'u')];
        let outputs = vec![
            ToolOutput::new("a", "a".repeat(100)),
            ToolOutput::new("b", "b".repeat(100)),
        ];
        let out = mgr.truncate(&messages, &outputs);
        let total = mgr.message_tokens(&out.messages) + mgr.tool_tokens(&out.tool_outputs);
        assert!(total <= 100);
        assert_eq!(out.messages.len(), 2);
    }

    #[test]
    fn test_emergency_truncate_drops_oldest_first() {
        let mgr = manager(ContextBudget::new(1000));
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first message"),
            ChatMessage::assistant("second message"),
            ChatMessage::user("third"),
        ];
        let target = mgr.message_tokens(&[messages[0].clone(), messages[2].clone(), messages[3].clone()]);
        let kept = mgr.emergency_truncate(&messages, target);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[1].content, "second message");
    }

    #[test]
    fn test_emergency_truncate_stops_at_protected_and_latest() {
        let mgr = manager(ContextBudget::new(1000));
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("old"),
            ChatMessage::user("pinned").protected(),
            ChatMessage::user("latest"),
        ];
        let kept = mgr.emergency_truncate(&messages, 0);
        let contents: Vec<_> = kept.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "pinned", "latest"]);
    }

    #[test]
    fn test_system_channel_always_protected() {
        let budget = ContextBudget::new(10);
        assert!(budget.is_protected(SYSTEM_CHANNEL));
        assert!(!budget.is_protected(HISTORY_CHANNEL));
    }

    #[test]
    fn test_from_config() {
        let mut config = BudgetConfig::default();
        config.tools.insert("search".into(), 123);
        config.protected.push("tool:notes".into());
        let budget = ContextBudget::from_config(&config);
        assert_eq!(budget.max_total_tokens(), 8000);
        assert_eq!(budget.channel_budget(HISTORY_CHANNEL), Some(4000));
        assert_eq!(budget.channel_budget("tool:search"), Some(123));
        assert_eq!(budget.channel_budget("tool:other"), Some(1000));
        assert!(budget.is_protected("tool:notes"));
    }

    #[tokio::test]
    async fn test_truncation_event_emitted() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let mut budget = ContextBudget::new(10_000);
        budget.set_budget(HISTORY_CHANNEL, 10);
        let mgr = manager(budget).with_event_bus(bus.clone());
        let messages: Vec<_> = (0..5).map(|i| ChatMessage::user(format!("msg {}", i))).collect();
        mgr.truncate(&messages, &[]);

        match rx.recv().await.unwrap() {
            WorkflowEvent::TruncationApplied { channel, .. } => assert_eq!(channel, HISTORY_CHANNEL),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
