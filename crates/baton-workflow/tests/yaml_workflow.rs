use std::sync::Arc;

use serde_json::json;

use baton_core::config::AppConfig;
use baton_core::error::BatonError;
use baton_test_utils::{StubAgent, StubTool};
use baton_workflow::{StepStatus, WorkflowContext, WorkflowDefinition, WorkflowExecutor};

const FLOW: &str = r#"
name: book
default_agent: writer
variables:
  topic: rust
steps:
  - name: pitch
    kind: agent
    prompt: "Pitch a book about {{ topic }}"
    output_variable: pitch
    guardrails: [non_empty]
  - name: gate
    kind: route
    branches:
      - when: 'pitch contains "rust"'
        steps:
          - name: approve
            kind: tool
            tool: stamp
            arguments:
              text: "{{ pitch }}"
            output_variable: approval
    default: []
  - name: chapters
    kind: loop
    source:
      csv: chapters.csv
    item_var: row
    parallel: true
    max_workers: 2
    output_variable: outlines
    body:
      - name: outline
        kind: agent
        prompt: "Outline {{ row.title }} ({{ row.pages }} pages)"
  - name: notes
    kind: loop
    source:
      file: notes.txt
    item_var: note
    output_variable: cleaned
    body:
      - name: clean
        kind: tool
        tool: stamp
        arguments:
          text: "{{ note }}"
          position: "{{ loop_index }}"
"#;

fn executor(writer: Arc<StubAgent>, stamp: Arc<StubTool>) -> WorkflowExecutor {
    let mut config = AppConfig::default();
    config.retry.backoff = false;
    WorkflowExecutor::new(config).with_agent(writer).with_tool(stamp)
}

#[tokio::test]
async fn test_yaml_workflow_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("flow.yaml"), FLOW).unwrap();
    std::fs::write(dir.path().join("chapters.csv"), "title,pages\nIntro,3\nOwnership,12\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "first\n\nsecond\n").unwrap();

    let writer = Arc::new(StubAgent::echo("writer"));
    let stamp = Arc::new(StubTool::echo("stamp"));
    let def = WorkflowDefinition::from_yaml_file(&dir.path().join("flow.yaml")).unwrap();
    let exec = executor(writer.clone(), stamp.clone());
    exec.validate(&def).unwrap();

    let result = exec.run(&def, WorkflowContext::new()).await.unwrap();
    assert!(result.succeeded(), "{:?}", result.failed_steps());

    assert_eq!(result.get("pitch"), Some(&json!("Pitch a book about rust")));
    assert_eq!(
        result.get("approval"),
        Some(&json!({"text": "Pitch a book about rust"}))
    );
    assert_eq!(
        result.get("outlines"),
        Some(&json!(["Outline Intro (3 pages)", "Outline Ownership (12 pages)"]))
    );
    assert_eq!(
        result.get("cleaned"),
        Some(&json!([
            {"text": "first", "position": 0},
            {"text": "second", "position": 1}
        ]))
    );
    assert!(result.get("row").is_none());
    assert_eq!(writer.call_count(), 3);
}

#[tokio::test]
async fn test_yaml_workflow_rejects_unknown_tool() {
    let def = WorkflowDefinition::from_yaml_str(FLOW).unwrap();
    let exec = WorkflowExecutor::new(AppConfig::default()).with_agent(Arc::new(StubAgent::echo("writer")));
    let err = exec.validate(&def).unwrap_err();
    assert!(matches!(err, BatonError::UnknownTool(ref name) if name == "stamp"));
}

#[tokio::test]
async fn test_missing_loop_file_fails_step() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("flow.yaml"), FLOW).unwrap();
    std::fs::write(dir.path().join("chapters.csv"), "title,pages\nIntro,3\n").unwrap();

    let def = WorkflowDefinition::from_yaml_file(&dir.path().join("flow.yaml")).unwrap();
    let exec = executor(Arc::new(StubAgent::echo("writer")), Arc::new(StubTool::echo("stamp")));
    let result = exec.run(&def, WorkflowContext::new()).await.unwrap();

    let notes = result.step("notes").unwrap();
    assert_eq!(notes.status, StepStatus::Failed);
    assert!(notes.error.as_ref().unwrap().message.contains("notes.txt"));
    assert_eq!(result.step("chapters").unwrap().status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_caller_variables_override_defaults() {
    let def = WorkflowDefinition::from_yaml_str(
        r#"
name: override
default_agent: writer
variables:
  topic: rust
steps:
  - name: pitch
    kind: agent
    prompt: "About {{ topic }}"
    output_variable: pitch
"#,
    )
    .unwrap();
    let exec = executor(Arc::new(StubAgent::echo("writer")), Arc::new(StubTool::echo("stamp")));
    let mut initial = WorkflowContext::new();
    initial.set_str("topic", "tokio");
    let result = exec.run(&def, initial).await.unwrap();
    assert_eq!(result.get("pitch"), Some(&json!("About tokio")));
}
