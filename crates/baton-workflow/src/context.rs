use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::definition::ContextPolicy;
use crate::template::lookup_path;

/// Variable bag shared by the steps of one workflow run.
///
/// Keys are strings, values are JSON. Writes are last-write-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    data: HashMap<String, serde_json::Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Resolve a dotted path such as `item.title`.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        lookup_path(&self.data, path)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &WorkflowContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The variables a step may read under `policy`.
    pub fn visible(&self, policy: &ContextPolicy) -> HashMap<String, serde_json::Value> {
        self.data
            .iter()
            .filter(|(key, _)| policy.allows(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// A detached copy holding only what `policy` lets through. Compound
    /// steps start their nested sequences from this.
    pub fn scoped(&self, policy: &ContextPolicy) -> WorkflowContext {
        Self::from_map(self.visible(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut ctx = WorkflowContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_last_write_wins() {
        let mut ctx = WorkflowContext::new();
        ctx.set_str("x", "first");
        ctx.set_str("x", "second");
        assert_eq!(ctx.get_str("x"), Some("second"));
    }

    #[test]
    fn test_merge() {
        let mut ctx1 = WorkflowContext::new();
        ctx1.set_str("a", "1");
        ctx1.set_str("b", "2");

        let mut ctx2 = WorkflowContext::new();
        ctx2.set_str("b", "overwritten");
        ctx2.set_str("c", "3");

        ctx1.merge(&ctx2);

        assert_eq!(ctx1.get_str("a"), Some("1"));
        assert_eq!(ctx1.get_str("b"), Some("overwritten"));
        assert_eq!(ctx1.get_str("c"), Some("3"));
    }

    #[test]
    fn test_lookup_dotted() {
        let mut ctx = WorkflowContext::new();
        ctx.set("item", json!({"title": "Intro", "tags": ["a", "b"]}));
        assert_eq!(ctx.lookup("item.title"), Some(&json!("Intro")));
        assert_eq!(ctx.lookup("item.tags.1"), Some(&json!("b")));
        assert_eq!(ctx.lookup("item.missing"), None);
    }

    #[test]
    fn test_visible_by_policy() {
        let mut ctx = WorkflowContext::new();
        ctx.set_str("a", "1");
        ctx.set_str("b", "2");

        assert_eq!(ctx.visible(&ContextPolicy::InheritAll).len(), 2);
        assert!(ctx.visible(&ContextPolicy::None).is_empty());

        let only = ctx.visible(&ContextPolicy::Only(vec!["b".into(), "zz".into()]));
        assert_eq!(only.len(), 1);
        assert_eq!(only["b"], json!("2"));
    }

    #[test]
    fn test_scoped_is_detached() {
        let mut ctx = WorkflowContext::new();
        ctx.set_str("a", "1");
        let mut child = ctx.scoped(&ContextPolicy::InheritAll);
        child.set_str("a", "changed");
        assert_eq!(ctx.get_str("a"), Some("1"));
    }
}
