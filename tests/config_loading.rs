// tests/config_loading.rs

mod common;
use crate::common::builders::{StepBuilder, WorkflowFileBuilder, cpu, lock, resource_file};
use crate::common::fake_actions::RecordingAction;
use crate::common::init_tracing;

use std::error::Error;
use std::fs;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use codomyrmex::config::{
    EngineConfig, WorkflowFile, load_engine_config, load_workflow_dir, load_workflow_file,
    save_resource_file,
};
use codomyrmex::errors::OrchestratorError;
use codomyrmex::logging::{LogLevel, resolve_level};
use codomyrmex::task::Parameters;
use codomyrmex::types::{AccessMode, ResourceType, TaskPriority};
use codomyrmex::workflow::Workflow;
use codomyrmex::ActionRegistry;

type TestResult = Result<(), Box<dyn Error>>;

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn empty_engine_config_uses_defaults() -> TestResult {
    let dir = TempDir::new()?;
    let path = write(&dir, "engine.toml", "");

    let cfg = load_engine_config(&path)?;
    assert_eq!(cfg.orchestrator.max_workers, 4);
    assert_eq!(cfg.orchestrator.poll_interval(), Duration::from_millis(50));
    assert_eq!(cfg.orchestrator.default_max_retries, 0);
    assert_eq!(cfg.orchestrator.default_retry_delay(), Duration::from_secs(1));
    assert_eq!(cfg.resources.sweep_interval(), Duration::from_secs(60));
    assert_eq!(cfg.resources.high_utilization_threshold, 90.0);
    assert!(cfg.resources.config_file.is_none());
    assert!(cfg.workflows.directory.is_none());
    assert!(cfg.logging.level.is_none());
    Ok(())
}

#[test]
fn engine_config_sections_are_parsed() -> TestResult {
    let dir = TempDir::new()?;
    let path = write(
        &dir,
        "engine.toml",
        r#"
[orchestrator]
max_workers = 16
poll_interval_ms = 10
default_max_retries = 3

[resources]
config_file = "resources.toml"
high_utilization_threshold = 75.5

[workflows]
directory = "flows"

[logging]
level = "warning"
"#,
    );

    let cfg = load_engine_config(&path)?;
    assert_eq!(cfg.orchestrator.max_workers, 16);
    assert_eq!(cfg.orchestrator.poll_interval_ms, 10);
    assert_eq!(cfg.orchestrator.default_max_retries, 3);
    assert_eq!(cfg.resources.high_utilization_threshold, 75.5);
    assert_eq!(
        cfg.resources.config_file.as_deref(),
        Some(std::path::Path::new("resources.toml"))
    );
    assert_eq!(cfg.logging.level, Some(LogLevel::Warn));
    Ok(())
}

#[test]
fn invalid_engine_config_values_are_rejected() -> TestResult {
    let dir = TempDir::new()?;
    let cases = [
        "[orchestrator]\nmax_workers = 0\n",
        "[orchestrator]\npoll_interval_ms = 0\n",
        "[resources]\nsweep_interval_secs = 0\n",
        "[resources]\nhigh_utilization_threshold = 0.0\n",
        "[resources]\nhigh_utilization_threshold = 150.0\n",
    ];
    for (i, contents) in cases.iter().enumerate() {
        let path = write(&dir, &format!("bad-{i}.toml"), contents);
        let err = load_engine_config(&path).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)), "case {i}: {err}");
    }

    let path = write(&dir, "broken.toml", "[orchestrator\nmax_workers = ");
    assert!(matches!(
        load_engine_config(&path),
        Err(OrchestratorError::TomlDe(_))
    ));
    assert!(matches!(
        load_engine_config(dir.path().join("absent.toml")),
        Err(OrchestratorError::Io(_))
    ));
    Ok(())
}

#[test]
fn workflow_file_converts_into_validated_workflow() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let file = WorkflowFileBuilder::new("build")
        .description("compile and package")
        .with_step(StepBuilder::new("fetch", "git", "clone").param("depth", json!(1)).build())
        .with_step(
            StepBuilder::new("compile", "cargo", "build")
                .after("fetch")
                .timeout_secs(2.5)
                .max_retries(2)
                .priority(TaskPriority::High)
                .claim(ResourceType::Cpu, AccessMode::Read)
                .build(),
        );
    let path = write(&dir, "build.toml", &file.to_toml());

    let workflow = load_workflow_file(&path)?;
    assert_eq!(workflow.name, "build");
    assert_eq!(workflow.description.as_deref(), Some("compile and package"));
    assert_eq!(workflow.steps.len(), 2);

    let fetch = workflow.step("fetch").unwrap();
    assert_eq!(fetch.parameters["depth"], json!(1));
    assert!(fetch.max_retries.is_none());

    let compile = workflow.step("compile").unwrap();
    assert_eq!(compile.depends_on, vec!["fetch"]);
    assert_eq!(compile.timeout, Some(Duration::from_millis(2500)));
    assert_eq!(compile.max_retries, Some(2));
    assert_eq!(compile.priority, Some(TaskPriority::High));
    assert_eq!(compile.resources.len(), 1);
    assert_eq!(compile.resources[0].identifier, "*");
    assert_eq!(compile.resources[0].mode, AccessMode::Read);
    Ok(())
}

#[test]
fn invalid_workflow_files_are_rejected() {
    let nameless = WorkflowFileBuilder::new("  ")
        .with_step(StepBuilder::new("a", "m", "x").build())
        .build();
    assert!(matches!(
        Workflow::try_from(nameless),
        Err(OrchestratorError::Config(_))
    ));

    let negative = WorkflowFileBuilder::new("neg")
        .with_step(StepBuilder::new("a", "m", "x").timeout_secs(-1.0).build())
        .build();
    let err = Workflow::try_from(negative).unwrap_err();
    assert!(err.to_string().contains("timeout_secs"), "{err}");

    let empty: WorkflowFile = WorkflowFileBuilder::new("empty").build();
    assert!(matches!(
        Workflow::try_from(empty),
        Err(OrchestratorError::Config(_))
    ));

    let dangling = WorkflowFileBuilder::new("dangling")
        .with_step(StepBuilder::new("a", "m", "x").after("ghost").build())
        .build();
    let err = Workflow::try_from(dangling).unwrap_err();
    assert_eq!(err.validation_errors().map(<[_]>::len), Some(1));
}

#[test]
fn workflow_directory_skips_malformed_files() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    let good = |name: &str| {
        WorkflowFileBuilder::new(name)
            .with_step(StepBuilder::new("only", "demo", "echo").build())
            .to_toml()
    };
    write(&dir, "b.toml", &good("beta"));
    write(&dir, "a.toml", &good("alpha"));
    write(&dir, "broken.toml", "name = ");
    write(
        &dir,
        "cyclic.toml",
        &WorkflowFileBuilder::new("cyclic")
            .with_step(StepBuilder::new("x", "m", "a").after("y").build())
            .with_step(StepBuilder::new("y", "m", "a").after("x").build())
            .to_toml(),
    );
    write(&dir, "notes.txt", "not a workflow");

    let names: Vec<String> = load_workflow_dir(dir.path())
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    assert!(load_workflow_dir(dir.path().join("missing")).is_empty());
    Ok(())
}

#[tokio::test]
async fn start_resolves_paths_relative_to_the_config_file() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;

    write(
        &dir,
        "conf/flows/hello.toml",
        &WorkflowFileBuilder::new("hello")
            .with_step(StepBuilder::new("greet", "demo", "echo").build())
            .to_toml(),
    );
    save_resource_file(
        dir.path().join("conf/resources.toml"),
        &resource_file(&[cpu("cpu-a", 2.0), lock("db")]),
    )?;
    let config = write(
        &dir,
        "conf/engine.toml",
        r#"
[orchestrator]
max_workers = 2
poll_interval_ms = 5

[resources]
config_file = "resources.toml"

[workflows]
directory = "flows"
"#,
    );

    let echo = RecordingAction::new();
    let mut actions = ActionRegistry::new();
    actions.register("demo", "echo", echo.clone());

    let engine = codomyrmex::start(&config, actions).await?;
    assert!(engine.is_running());
    assert_eq!(engine.workflows().workflows(), vec!["hello"]);

    let ids: Vec<String> = engine.resources().resources().into_iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"cpu-a".to_string()));
    assert!(ids.contains(&"db".to_string()));

    let outcome = engine
        .execute_workflow("hello", None, Parameters::new())
        .await?;
    assert!(outcome.success);
    assert_eq!(echo.log.len(), 1);

    engine.shutdown().await;
    assert!(!engine.is_running());
    Ok(())
}

#[test]
fn default_engine_config_is_valid() -> TestResult {
    let cfg = EngineConfig::default();
    codomyrmex::config::validate_engine_config(&cfg)?;
    Ok(())
}

#[test]
fn log_levels_parse_case_insensitively() {
    assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
    assert_eq!(" warning ".parse::<LogLevel>(), Ok(LogLevel::Warn));
    assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
    assert!("verbose".parse::<LogLevel>().is_err());

    assert_eq!(resolve_level(Some(LogLevel::Error)), LogLevel::Error);
    assert_eq!(LogLevel::Warn.to_string(), "warn");
    assert_eq!(LogLevel::Debug.as_tracing(), tracing::Level::DEBUG);
}
