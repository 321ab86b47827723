//! Structural checks run before a workflow makes any external call.

use std::collections::HashSet;

use baton_core::error::{BatonError, Result};

use crate::condition::condition_variables;
use crate::definition::{ContextPolicy, LoopSource, Step, StepKind, WorkflowDefinition};
use crate::resolver::LOOP_INDEX;
use crate::template::{referenced_in_value, referenced_variables, root_of};

/// Names of the collaborators a run can reach.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub agents: HashSet<String>,
    pub tools: HashSet<String>,
    pub guardrails: HashSet<String>,
}

/// Validate `def`, returning the first configuration error in document order.
///
/// `initial` names variables the caller will supply at run time. Without a
/// catalog, agent/tool/guardrail references are not checked.
pub fn validate(def: &WorkflowDefinition, initial: &[String], catalog: Option<&Catalog>) -> Result<()> {
    if let (Some(catalog), Some(default)) = (catalog, &def.default_agent) {
        if !catalog.agents.contains(default) {
            return Err(BatonError::UnknownAgent(default.clone()));
        }
    }

    let mut validator = Validator {
        catalog,
        has_default_agent: def.default_agent.is_some(),
        names: HashSet::new(),
    };
    let mut available: HashSet<String> = def
        .variables
        .keys()
        .cloned()
        .chain(initial.iter().cloned())
        .collect();
    validator.sequence(&def.steps, &mut available)
}

struct Validator<'a> {
    catalog: Option<&'a Catalog>,
    has_default_agent: bool,
    names: HashSet<String>,
}

impl Validator<'_> {
    fn sequence(&mut self, steps: &[Step], available: &mut HashSet<String>) -> Result<()> {
        for step in steps {
            self.step(step, available)?;
        }
        Ok(())
    }

    fn step(&mut self, step: &Step, available: &mut HashSet<String>) -> Result<()> {
        if !self.names.insert(step.name.clone()) {
            return Err(BatonError::DuplicateStepName(step.name.clone()));
        }

        let visible: HashSet<String> = match &step.context_policy {
            ContextPolicy::InheritAll => available.clone(),
            ContextPolicy::None => HashSet::new(),
            ContextPolicy::Only(keys) => available
                .iter()
                .filter(|k| keys.contains(k))
                .cloned()
                .collect(),
        };

        if let Some(catalog) = self.catalog {
            if let Some(missing) = step.guardrails.iter().find(|g| !catalog.guardrails.contains(*g)) {
                return Err(BatonError::UnknownGuardrail(missing.clone()));
            }
        }

        match &step.kind {
            StepKind::Agent(agent) => {
                require_all(step, &referenced_variables(&agent.prompt), &visible)?;
                match &agent.agent {
                    Some(name) => self.require_agent(name)?,
                    None if !self.has_default_agent => {
                        return Err(BatonError::InvalidStep {
                            step: step.name.clone(),
                            message: "no agent named and the workflow has no default agent".into(),
                        })
                    }
                    None => {}
                }
                for handoff in &agent.handoff {
                    self.require_agent(&handoff.to)?;
                    if let Some(prompt) = &handoff.prompt {
                        require_all(step, &referenced_variables(prompt), &visible)?;
                    }
                }
            }
            StepKind::Tool(tool) => {
                let args = serde_json::Value::Object(tool.arguments.clone());
                require_all(step, &referenced_in_value(&args), &visible)?;
                if let Some(catalog) = self.catalog {
                    if !catalog.tools.contains(&tool.tool) {
                        return Err(BatonError::UnknownTool(tool.tool.clone()));
                    }
                }
            }
            StepKind::Route(route) => {
                let Some(default) = &route.default else {
                    return Err(BatonError::MissingDefaultRoute {
                        step: step.name.clone(),
                    });
                };
                for branch in &route.branches {
                    require_all(step, &condition_variables(&branch.condition), &visible)?;
                }
                let sequences = route
                    .branches
                    .iter()
                    .map(|b| b.steps.as_slice())
                    .chain(std::iter::once(default.as_slice()));
                for seq in sequences {
                    let mut inner = visible.clone();
                    self.sequence(seq, &mut inner)?;
                    available.extend(inner);
                }
            }
            StepKind::Loop(spec) => {
                if spec.max_workers == Some(0) {
                    return Err(invalid(step, "max_workers must be at least 1"));
                }
                if let LoopSource::Variable(name) = &spec.source {
                    require_all(step, &[root_of(name).to_string()], &visible)?;
                }
                // Iterations are isolated: nothing from the body reaches the parent.
                let mut inner = visible.clone();
                inner.insert(spec.item_var.clone());
                inner.insert(LOOP_INDEX.to_string());
                self.sequence(&spec.body, &mut inner)?;
            }
            StepKind::Parallel(spec) => {
                let mut claimed: HashSet<String> = HashSet::new();
                for branch in &spec.branches {
                    let mut inner = visible.clone();
                    self.sequence(branch, &mut inner)?;
                    for output in declared_outputs(branch) {
                        if !claimed.insert(output.clone()) {
                            return Err(BatonError::ConflictingOutputVariable {
                                step: step.name.clone(),
                                variable: output,
                            });
                        }
                    }
                    available.extend(inner);
                }
            }
            StepKind::Repeat(spec) => {
                if spec.max_iterations == 0 {
                    return Err(invalid(step, "max_iterations must be at least 1"));
                }
                let mut inner = visible.clone();
                inner.insert(LOOP_INDEX.to_string());
                self.sequence(&spec.body, &mut inner)?;
                require_all(step, &condition_variables(&spec.until), &inner)?;
                inner.remove(LOOP_INDEX);
                available.extend(inner);
            }
        }

        if let Some(output) = &step.output_variable {
            available.insert(output.clone());
        }
        Ok(())
    }

    fn require_agent(&self, name: &str) -> Result<()> {
        match self.catalog {
            Some(catalog) if !catalog.agents.contains(name) => Err(BatonError::UnknownAgent(name.to_string())),
            _ => Ok(()),
        }
    }
}

fn require_all(step: &Step, variables: &[String], visible: &HashSet<String>) -> Result<()> {
    match variables.iter().find(|v| !visible.contains(*v)) {
        Some(missing) => Err(BatonError::UnresolvedVariable {
            step: step.name.clone(),
            variable: missing.clone(),
        }),
        None => Ok(()),
    }
}

fn invalid(step: &Step, message: &str) -> BatonError {
    BatonError::InvalidStep {
        step: step.name.clone(),
        message: message.to_string(),
    }
}

/// Variables a sequence writes into the enclosing context. Loop bodies are
/// excluded because their iterations are isolated.
fn declared_outputs(steps: &[Step]) -> Vec<String> {
    let mut out = Vec::new();
    for step in steps {
        out.extend(step.output_variable.iter().cloned());
        if !matches!(step.kind, StepKind::Loop(_)) {
            for seq in step.sequences() {
                out.extend(declared_outputs(seq));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}
