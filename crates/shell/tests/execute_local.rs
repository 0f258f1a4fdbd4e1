//! End-to-end execution through the local backend.

#![cfg(unix)]

use std::sync::Once;
use std::time::{Duration, Instant};

use stackprobe_shell::{ExecuteOptions, ShellError, execute, local_execute};

/// Routes harness tracing to the test output when `RUST_LOG` is set.
fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn echo_returns_its_output_and_a_zero_status() {
    let result = execute("echo hello", &ExecuteOptions::new()).expect("execute");
    assert_eq!(result.stdout.trim(), "hello");
    assert_eq!(result.exit_status, 0);
    assert!(result.stderr.is_empty());
}

#[test]
fn unchecked_execution_reports_the_raw_exit_status() {
    let result = execute("exit 3", &ExecuteOptions::new().without_check()).expect("execute");
    assert_eq!(result.exit_status, 3);
}

#[test]
fn checked_execution_raises_command_failed_for_the_same_command() {
    let error = execute("exit 3", &ExecuteOptions::new()).expect_err("check failure");
    assert_eq!(error.exit_status(), Some(3));
    assert!(matches!(error, ShellError::CommandFailed { .. }));
}

#[test]
fn command_failure_carries_the_command_line_and_captured_streams() {
    let error = execute(
        "echo visible-out; echo visible-err >&2; exit 9",
        &ExecuteOptions::new(),
    )
    .expect_err("exit 9");
    let rendered = error.to_string();
    assert!(rendered.contains("visible-out"));
    assert!(rendered.contains("visible-err"));
    assert!(rendered.contains("exit status 9"));
}

#[test]
fn slow_commands_time_out_rather_than_run_to_completion() {
    init_tracing();
    let started = Instant::now();
    let error = execute(
        "sleep 5",
        &ExecuteOptions::new().with_timeout(Duration::from_secs(1)),
    )
    .expect_err("timeout");
    let elapsed = started.elapsed();
    assert!(error.is_timeout(), "expected timeout, got: {error}");
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "took too long: {elapsed:?}");
}

#[test]
fn stdin_round_trips_byte_for_byte() {
    let payload = "three\nlines\nof text\n";
    let result = execute("cat", &ExecuteOptions::new().with_stdin(payload))
        .expect("execute");
    assert_eq!(result.stdout, payload);
    assert_eq!(result.exit_status, 0);
}

#[test]
fn large_stdin_payloads_survive_pipe_backpressure() {
    let payload: String = "0123456789abcdef\n".repeat(16 * 1024);
    let result = execute("cat", &ExecuteOptions::new().with_stdin(payload.clone()))
        .expect("execute");
    assert_eq!(result.stdout.len(), payload.len());
    assert_eq!(result.stdout, payload);
}

#[test]
fn shell_syntax_is_honored_by_the_default_wrapper() {
    let result = execute(
        "for i in 1 2 3; do echo line-$i; done",
        &ExecuteOptions::new(),
    )
    .expect("execute");
    assert_eq!(result.stdout, "line-1\nline-2\nline-3\n");
}

#[test]
fn quoted_arguments_survive_the_shell_wrapper() {
    let result = execute("printf '%s' 'a b'", &ExecuteOptions::new()).expect("execute");
    assert_eq!(result.stdout, "a b");
}

#[test]
fn environment_variables_reach_the_command() {
    let result = execute(
        "printf '%s' \"$PROBE_MARKER\"",
        &ExecuteOptions::new().with_environment_variable("PROBE_MARKER", "fault-injected"),
    )
    .expect("execute");
    assert_eq!(result.stdout, "fault-injected");
}

#[test]
fn working_directory_is_honored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = execute("pwd", &ExecuteOptions::new().with_current_dir(dir.path()))
        .expect("execute");
    let reported = result.stdout.trim();
    let expected = dir.path().canonicalize().expect("canonicalize");
    assert_eq!(
        std::path::Path::new(reported).canonicalize().expect("canonicalize"),
        expected
    );
}

#[test]
fn direct_argument_vectors_run_without_a_shell() {
    let result = execute(
        "printf hello-%s direct",
        &ExecuteOptions::new().without_shell(),
    )
    .expect("execute");
    assert_eq!(result.stdout, "hello-direct");
}

#[test]
fn custom_expected_exit_status_is_accepted() {
    let result = execute(
        "exit 42",
        &ExecuteOptions::new().with_expected_exit_status(42),
    )
    .expect("execute");
    assert_eq!(result.exit_status, 42);
}

#[test]
fn local_execute_matches_the_generic_facade() {
    let result = local_execute("echo routed", &ExecuteOptions::new()).expect("execute");
    assert_eq!(result.stdout.trim(), "routed");
}

#[test]
fn stderr_is_captured_separately_from_stdout() {
    let result = execute(
        "echo to-out; echo to-err >&2",
        &ExecuteOptions::new(),
    )
    .expect("execute");
    assert_eq!(result.stdout, "to-out\n");
    assert_eq!(result.stderr, "to-err\n");
}

#[test]
fn result_records_the_resolved_command_line() {
    let result = execute("echo hello", &ExecuteOptions::new()).expect("execute");
    assert!(result.command.contains("/bin/sh"));
    assert!(result.command.contains("echo hello"));
}
