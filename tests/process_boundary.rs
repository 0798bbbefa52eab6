//! Runs through the worker-process boundary and the scriptbox binary
//!
//! The worker is the crate's own binary re-executed with the hidden
//! worker role, exactly as the CLI does it.

#![cfg(unix)]

use scriptbox::{
    BoundaryKind, HostEvent, OutputEvent, RunOutcome, Sandbox, SandboxConfig, Severity,
};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

const SCRIPTBOX: &str = env!("CARGO_BIN_EXE_scriptbox");

const COMPLETED: HostEvent = HostEvent::Terminal {
    result: RunOutcome::Completed,
};

fn process_sandbox(timeout: Duration) -> Sandbox {
    let config = SandboxConfig::default()
        .with_boundary(BoundaryKind::Process)
        .with_worker_program(SCRIPTBOX)
        .with_timeout(timeout);
    Sandbox::new(config).unwrap()
}

fn scriptbox(args: &[&str], stdin: &str) -> std::process::Output {
    let mut child = Command::new(SCRIPTBOX)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn test_worker_process_log_and_complete() {
    let mut sandbox = process_sandbox(Duration::from_secs(5));
    let report = sandbox.run_to_completion("console.log(1+1)").unwrap();
    assert_eq!(
        report.events,
        vec![HostEvent::Output(OutputEvent::info("2")), COMPLETED]
    );
}

#[test]
fn test_worker_process_errors_and_rejections() {
    let mut sandbox = process_sandbox(Duration::from_secs(5));

    let report = sandbox.run_to_completion("throw new Error(\"x\")").unwrap();
    assert_eq!(report.outputs().count(), 1);
    assert_eq!(report.outputs().next().unwrap().severity, Severity::Error);
    assert!(report.texts()[0].contains('x'));
    assert_eq!(report.outcome, RunOutcome::Completed);

    let report = sandbox.run_to_completion("Promise.reject(\"y\")").unwrap();
    assert_eq!(report.texts(), vec!["❌ Unhandled Promise Rejection: y"]);
    assert_eq!(report.terminal_count(), 1);
}

#[test]
fn test_worker_process_killed_on_timeout() {
    let mut sandbox = process_sandbox(Duration::from_millis(500));
    let report = sandbox
        .run_to_completion("console.log('spinning');\nwhile(true){}")
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(
        report.texts(),
        vec!["spinning", "⚠️ Execution timeout (500ms)"]
    );
    assert!(!sandbox.is_context_alive());

    // The next run gets a fresh worker.
    let report = sandbox.run_to_completion("console.log('again')").unwrap();
    assert_eq!(report.texts(), vec!["again"]);
    assert_eq!(report.generation, 2);
}

#[test]
fn test_worker_process_lingering_timer() {
    let mut sandbox = process_sandbox(Duration::from_secs(5));
    let report = sandbox
        .run_to_completion("setTimeout(() => console.warn('late'), 10);")
        .unwrap();
    assert_eq!(
        report.events,
        vec![COMPLETED, HostEvent::Output(OutputEvent::warn("late"))]
    );
}

#[test]
fn test_cli_run_prints_display_lines() {
    let output = scriptbox(
        &["run", "-"],
        "console.log('Sum:', 1 + 2 + 3);\nconsole.warn('careful');",
    );
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "Sum: 6\n⚠️ careful\n"
    );
}

#[test]
fn test_cli_run_json_events() {
    let output = scriptbox(&["run", "--json", "-"], "console.log(1+1)");
    assert!(output.status.success());
    let events: Vec<HostEvent> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(
        events,
        vec![HostEvent::Output(OutputEvent::info("2")), COMPLETED]
    );
}

#[test]
fn test_cli_run_timeout_exit_code() {
    let output = scriptbox(
        &["run", "--timeout-ms", "300", "--boundary", "process", "-"],
        "while(true){}",
    );
    assert_eq!(output.status.code(), Some(124));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "⚠️ Execution timeout (300ms)\n"
    );
}

#[test]
fn test_cli_run_expect() {
    let output = scriptbox(&["run", "--expect", "A\\nB", "-"], "console.log('A'); console.log('B');");
    assert!(output.status.success());

    let output = scriptbox(&["run", "--expect", "A", "-"], "console.log('B');");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_cli_check() {
    let output = scriptbox(&["check", "-"], "export const x = 1;");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("'use strict';"));
    assert_eq!(stdout.split_whitespace().collect::<Vec<_>>(), vec!["'use", "strict';", "const", "x", "=", "1;"]);

    let output = scriptbox(&["check", "-"], "if (");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("❌ Transformation Error: "));
}

#[test]
fn test_cli_audit_log_written() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.log");
    let output = scriptbox(
        &["run", "--audit-log", audit.to_str().unwrap(), "-"],
        "console.log('audited')",
    );
    assert!(output.status.success());

    let content = std::fs::read_to_string(&audit).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|line| {
            let entry: serde_json::Value = serde_json::from_str(line).unwrap();
            entry["event_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert!(kinds.contains(&"RunStart".to_string()));
    assert!(kinds.contains(&"ContextLaunch".to_string()));
    assert!(kinds.contains(&"RunComplete".to_string()));
}
