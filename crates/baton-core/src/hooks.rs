use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::event::{EventBus, WorkflowEvent};

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}

/// Commands configured for `event`.
pub fn commands_for<'a>(hooks: &'a HooksConfig, event: &WorkflowEvent) -> &'a [String] {
    match event {
        WorkflowEvent::WorkflowStarted { .. } => &hooks.on_workflow_start,
        WorkflowEvent::StepCompleted { .. } => &hooks.on_step_complete,
        WorkflowEvent::WorkflowCompleted { .. } => &hooks.on_workflow_complete,
        _ => &[],
    }
}

/// Environment handed to hook commands for `event`.
pub fn hook_env(event: &WorkflowEvent) -> Vec<(&'static str, String)> {
    let mut env = vec![("BATON_EVENT", event.name().to_string())];
    match event {
        WorkflowEvent::WorkflowStarted { run_id, workflow } => {
            env.push(("BATON_RUN_ID", run_id.to_string()));
            env.push(("BATON_WORKFLOW", workflow.clone()));
        }
        WorkflowEvent::StepCompleted {
            run_id,
            step,
            status,
            attempts,
            ..
        } => {
            env.push(("BATON_RUN_ID", run_id.to_string()));
            env.push(("BATON_STEP", step.clone()));
            env.push(("BATON_STATUS", status.clone()));
            env.push(("BATON_ATTEMPTS", attempts.to_string()));
        }
        WorkflowEvent::WorkflowCompleted {
            run_id,
            workflow,
            succeeded,
            ..
        } => {
            env.push(("BATON_RUN_ID", run_id.to_string()));
            env.push(("BATON_WORKFLOW", workflow.clone()));
            let status = if *succeeded { "succeeded" } else { "failed" };
            env.push(("BATON_STATUS", status.to_string()));
        }
        _ => {}
    }
    env
}

/// Run configured hooks for every event on `bus` until the bus is dropped.
pub fn spawn_hook_listener(bus: &Arc<EventBus>, hooks: HooksConfig) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let commands = commands_for(&hooks, &event);
                    if commands.is_empty() {
                        continue;
                    }
                    debug!(event = event.name(), hooks = commands.len(), "Running hooks");
                    let env = hook_env(&event);
                    let pairs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (*k, v.as_str())).collect();
                    run_hooks(commands, &pairs).await;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Hook listener fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
