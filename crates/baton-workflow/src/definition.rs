use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use baton_core::config::HandoffContextPolicy;
use baton_core::error::{BatonError, Result};

/// A declarative workflow: an ordered list of steps sharing one variable bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Initial variables, overridden by the caller's initial context.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Agent used by agent steps that name none.
    #[serde(default, alias = "default_agent_ref")]
    pub default_agent: Option<String>,
    pub steps: Vec<Step>,
    /// Directory relative loop-source paths resolve against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            variables: HashMap::new(),
            default_agent: None,
            steps,
            base_dir: None,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a workflow document. Relative loop-source paths resolve against
    /// the document's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BatonError::ConfigNotFound(path.display().to_string())
            } else {
                BatonError::Io(e)
            }
        })?;
        let mut def = Self::from_yaml_str(&content)?;
        def.base_dir = path.parent().map(Path::to_path_buf);
        Ok(def)
    }

    /// Every step in the document, depth first, in declaration order.
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        for step in &self.steps {
            step.collect_into(&mut out);
        }
        out
    }

    /// Agent names referenced anywhere in the document.
    pub fn agent_refs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.default_agent.iter().cloned().collect();
        for step in self.all_steps() {
            if let StepKind::Agent(agent) = &step.kind {
                names.extend(agent.agent.iter().cloned());
                names.extend(agent.handoff.iter().map(|h| h.to.clone()));
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Tool names referenced anywhere in the document.
    pub fn tool_refs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .all_steps()
            .into_iter()
            .filter_map(|s| match &s.kind {
                StepKind::Tool(tool) => Some(tool.tool.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Guardrail names referenced anywhere in the document.
    pub fn guardrail_refs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .all_steps()
            .into_iter()
            .flat_map(|s| s.guardrails.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Reaction to a step failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Skip,
    Continue,
    Retry,
}

/// Which workflow variables a step may read.
///
/// Written as `inherit_all`, `none`, or `{ only: [a, b] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ContextPolicyRepr", into = "ContextPolicyRepr")]
pub enum ContextPolicy {
    #[default]
    InheritAll,
    None,
    Only(Vec<String>),
}

impl ContextPolicy {
    pub fn allows(&self, key: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::None => false,
            Self::Only(keys) => keys.iter().any(|k| k == key),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ContextPolicyRepr {
    Named(String),
    Only { only: Vec<String> },
}

impl TryFrom<ContextPolicyRepr> for ContextPolicy {
    type Error = String;

    fn try_from(repr: ContextPolicyRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ContextPolicyRepr::Named(name) => match name.as_str() {
                "inherit_all" | "inherit-all" | "all" => Ok(Self::InheritAll),
                "none" => Ok(Self::None),
                other => Err(format!(
                    "unknown context policy '{}', expected inherit_all, none or {{only: [..]}}",
                    other
                )),
            },
            ContextPolicyRepr::Only { only } => Ok(Self::Only(only)),
        }
    }
}

impl From<ContextPolicy> for ContextPolicyRepr {
    fn from(policy: ContextPolicy) -> Self {
        match policy {
            ContextPolicy::InheritAll => Self::Named("inherit_all".into()),
            ContextPolicy::None => Self::Named("none".into()),
            ContextPolicy::Only(only) => Self::Only { only },
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    /// Overrides the configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub context_policy: ContextPolicy,
    #[serde(default)]
    pub output_variable: Option<String>,
    /// Guardrail names checked against the step's value.
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Deadline for the agent or tool call, overriding config.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Agent(AgentStep),
    Tool(ToolStep),
    Route(RouteStep),
    Loop(LoopStep),
    Parallel(ParallelStep),
    Repeat(RepeatStep),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Falls back to the workflow's default agent.
    #[serde(default, alias = "agent_ref")]
    pub agent: Option<String>,
    #[serde(alias = "prompt_template")]
    pub prompt: String,
    /// Agents the conversation is handed to, in order, after the first answer.
    #[serde(default)]
    pub handoff: Vec<HandoffSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub to: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub context_policy: Option<HandoffContextPolicy>,
    #[serde(default)]
    pub max_context_messages: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStep {
    #[serde(alias = "tool_ref")]
    pub tool: String,
    #[serde(default, alias = "arguments_template")]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStep {
    /// Checked in declaration order; the first match runs.
    #[serde(default)]
    pub branches: Vec<RouteBranch>,
    /// Runs when no branch matches. Required, may be empty.
    #[serde(default)]
    pub default: Option<Vec<Step>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBranch {
    #[serde(alias = "when")]
    pub condition: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub source: LoopSource,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    pub body: Vec<Step>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

fn default_item_var() -> String {
    "item".to_string()
}

/// Where loop items come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopSource {
    List(Vec<serde_json::Value>),
    /// A context variable: an array, or a string split into lines.
    Variable(String),
    /// One item per non-empty line.
    File(PathBuf),
    /// One object per record, keyed by the header row.
    Csv(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    pub branches: Vec<Vec<Step>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatStep {
    pub body: Vec<Step>,
    #[serde(alias = "until_condition")]
    pub until: String,
    pub max_iterations: u32,
}

impl Step {
    fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            on_error: OnError::default(),
            max_retries: None,
            context_policy: ContextPolicy::default(),
            output_variable: None,
            guardrails: vec![],
            timeout_secs: None,
            kind,
        }
    }

    pub fn agent(name: impl Into<String>, agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Agent(AgentStep {
                agent: Some(agent.into()),
                prompt: prompt.into(),
                handoff: vec![],
            }),
        )
    }

    pub fn tool(
        name: impl Into<String>,
        tool: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::new(
            name,
            StepKind::Tool(ToolStep {
                tool: tool.into(),
                arguments,
            }),
        )
    }

    pub fn route(name: impl Into<String>, branches: Vec<RouteBranch>, default: Vec<Step>) -> Self {
        Self::new(
            name,
            StepKind::Route(RouteStep {
                branches,
                default: Some(default),
            }),
        )
    }

    pub fn for_each(
        name: impl Into<String>,
        source: LoopSource,
        item_var: impl Into<String>,
        body: Vec<Step>,
    ) -> Self {
        Self::new(
            name,
            StepKind::Loop(LoopStep {
                source,
                item_var: item_var.into(),
                body,
                parallel: false,
                max_workers: None,
            }),
        )
    }

    pub fn parallel(name: impl Into<String>, branches: Vec<Vec<Step>>) -> Self {
        Self::new(name, StepKind::Parallel(ParallelStep { branches }))
    }

    pub fn repeat(
        name: impl Into<String>,
        body: Vec<Step>,
        until: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self::new(
            name,
            StepKind::Repeat(RepeatStep {
                body,
                until: until.into(),
                max_iterations,
            }),
        )
    }

    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn with_guardrail(mut self, guardrail: impl Into<String>) -> Self {
        self.guardrails.push(guardrail.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Run a loop's iterations concurrently.
    pub fn in_parallel(mut self, max_workers: usize) -> Self {
        if let StepKind::Loop(ref mut l) = self.kind {
            l.parallel = true;
            l.max_workers = Some(max_workers);
        }
        self
    }

    /// Hand the agent's conversation on to `target` after it answers.
    pub fn with_handoff(mut self, spec: HandoffSpec) -> Self {
        if let StepKind::Agent(ref mut a) = self.kind {
            a.handoff.push(spec);
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Agent(_) => "agent",
            StepKind::Tool(_) => "tool",
            StepKind::Route(_) => "route",
            StepKind::Loop(_) => "loop",
            StepKind::Parallel(_) => "parallel",
            StepKind::Repeat(_) => "repeat",
        }
    }

    /// Nested step sequences, in declaration order.
    pub fn sequences(&self) -> Vec<&[Step]> {
        match &self.kind {
            StepKind::Agent(_) | StepKind::Tool(_) => vec![],
            StepKind::Route(r) => {
                let mut out: Vec<&[Step]> = r.branches.iter().map(|b| b.steps.as_slice()).collect();
                if let Some(default) = &r.default {
                    out.push(default);
                }
                out
            }
            StepKind::Loop(l) => vec![&l.body],
            StepKind::Parallel(p) => p.branches.iter().map(Vec::as_slice).collect(),
            StepKind::Repeat(r) => vec![&r.body],
        }
    }

    fn collect_into<'a>(&'a self, out: &mut Vec<&'a Step>) {
        out.push(self);
        for seq in self.sequences() {
            for step in seq {
                step.collect_into(out);
            }
        }
    }
}

impl HandoffSpec {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            to: target.into(),
            prompt: None,
            context_policy: None,
            max_context_messages: None,
            timeout_secs: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_policy(mut self, policy: HandoffContextPolicy) -> Self {
        self.context_policy = Some(policy);
        self
    }
}

impl RouteBranch {
    pub fn new(condition: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            condition: condition.into(),
            steps,
        }
    }
}
