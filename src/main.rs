mod stubs;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use baton_agent::budget::{ContextBudget, ContextBudgetManager};
use baton_agent::tokens::estimator_from_config;
use baton_core::config::AppConfig;
use baton_core::event::EventBus;
use baton_core::hooks::spawn_hook_listener;
use baton_workflow::validate::validate;
use baton_workflow::{StepResult, WorkflowContext, WorkflowDefinition, WorkflowExecutor, WorkflowResult};

use stubs::{EchoAgent, EchoTool, PassGuardrail};

#[derive(Parser)]
#[command(name = "baton", version, about = "Declarative multi-agent workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "baton.toml", env = "BATON_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file for configuration errors
    Validate {
        /// Workflow YAML file
        file: PathBuf,
        /// Variable the caller will supply at run time (key=value)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
    },
    /// Run a workflow against echo agents and tools
    DryRun {
        /// Workflow YAML file
        file: PathBuf,
        /// Initial variable (key=value, value parsed as JSON when possible)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("baton=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file, vars } => {
            let def = load_workflow(&file)?;
            let supplied: Vec<String> = vars.into_iter().map(|(k, _)| k).collect();
            validate(&def, &supplied, None).with_context(|| format!("{} is invalid", file.display()))?;
            println!("{}: ok ({} steps)", def.name, def.all_steps().len());
            Ok(())
        }
        Commands::DryRun { file, vars, json } => {
            let def = load_workflow(&file)?;
            let mut initial = WorkflowContext::new();
            for (key, value) in vars {
                initial.set(key, value);
            }
            let result = dry_run(config, &def, initial).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            if !result.succeeded() {
                bail!("workflow '{}' failed", result.name);
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        Ok(AppConfig::default())
    }
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    WorkflowDefinition::from_yaml_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn dry_run(
    config: AppConfig,
    def: &WorkflowDefinition,
    initial: WorkflowContext,
) -> anyhow::Result<WorkflowResult> {
    let event_bus = Arc::new(EventBus::default());
    let hooks = match &config.hooks {
        Some(hooks) if !hooks.is_empty() => Some(spawn_hook_listener(&event_bus, hooks.clone())),
        _ => None,
    };
    let budget = ContextBudgetManager::new(
        ContextBudget::from_config(&config.budget),
        estimator_from_config(&config.budget)?,
    )
    .with_event_bus(event_bus.clone());

    let mut executor = WorkflowExecutor::new(config)
        .with_budget(budget)
        .with_event_bus(event_bus.clone());
    for agent in def.agent_refs() {
        executor = executor.with_agent(Arc::new(EchoAgent::new(agent)));
    }
    for tool in def.tool_refs() {
        executor = executor.with_tool(Arc::new(EchoTool::new(tool)));
    }
    let registered = executor.catalog().guardrails;
    for guardrail in def.guardrail_refs() {
        if !registered.contains(&guardrail) {
            executor = executor.with_guardrail(Arc::new(PassGuardrail::new(guardrail)));
        }
    }

    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let result = executor.run(def, initial).await?;

    // Dropping the last bus handle lets the hook listener drain and exit.
    drop(executor);
    drop(event_bus);
    if let Some(handle) = hooks {
        let _ = handle.await;
    }
    Ok(result)
}

fn print_result(result: &WorkflowResult) {
    println!(
        "{} [{}] {} in {}ms",
        result.name, result.run_id, result.status, result.elapsed_ms
    );
    for step in &result.step_results {
        print_step(step, 1);
    }
    if result.was_cancelled() {
        println!("(cancelled)");
    }
}

fn print_step(step: &StepResult, depth: usize) {
    let indent = "  ".repeat(depth);
    match &step.error {
        Some(e) => println!(
            "{}{}: {} after {} attempt(s) [{}] {}",
            indent, step.name, step.status, step.attempts, e.kind, e.message
        ),
        None => println!("{}{}: {} ({}ms)", indent, step.name, step.status, step.elapsed_ms),
    }
    for child in &step.children {
        print_step(child, depth + 1);
    }
}

/// Parse `key=value`, reading the value as JSON when it is valid JSON.
fn parse_var(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("topic=rust").unwrap(), ("topic".into(), serde_json::json!("rust")));
        assert_eq!(parse_var("n=3").unwrap().1, serde_json::json!(3));
        assert_eq!(parse_var("tags=[\"a\"]").unwrap().1, serde_json::json!(["a"]));
        assert_eq!(parse_var("eq=a=b").unwrap().1, serde_json::json!("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["baton", "dry-run", "flow.yaml", "--var", "topic=rust", "--json"]).unwrap();
        match cli.command {
            Commands::DryRun { file, vars, json } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(vars.len(), 1);
                assert!(json);
            }
            _ => panic!("expected dry-run"),
        }
    }
}
