#![cfg(unix)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use quill_core::{
    redact::{NoRedaction, PatternRedactor},
    runner::{ProcessRunner, RunRequest, RunnerConfig, SUCCESS_MESSAGE},
    supervisor::{DirectSupervisor, ProcessGroupSupervisor, Supervisor, Termination},
};
use tokio::process::Command;

fn runner() -> ProcessRunner {
    ProcessRunner::new(RunnerConfig::default(), Arc::new(PatternRedactor::default()))
}

fn sh(script: &str, timeout: Duration) -> RunRequest {
    RunRequest::new("/bin/sh", timeout).args(["-c", script])
}

#[tokio::test]
async fn test_exit_zero_captures_stdout() {
    let res = runner().run(sh("echo hello", Duration::from_secs(10))).await;
    assert!(res.success);
    assert_eq!(res.message, SUCCESS_MESSAGE);
    assert_eq!(res.output.as_deref(), Some("hello\n"));
    assert_eq!(res.exit_code, Some(0));
    assert!(!res.timed_out);
}

#[tokio::test]
async fn test_nonzero_exit_prefers_stderr() {
    let res = runner()
        .run(sh("echo out; echo broken >&2; exit 3", Duration::from_secs(10)))
        .await;
    assert!(!res.success);
    assert!(res.message.contains('3'));
    assert_eq!(res.exit_code, Some(3));
    assert_eq!(res.error.as_deref(), Some("broken\n"));
}

#[tokio::test]
async fn test_nonzero_exit_falls_back_to_stdout() {
    let res = runner()
        .run(sh("echo only-stdout; exit 1", Duration::from_secs(10)))
        .await;
    assert!(!res.success);
    assert_eq!(res.error.as_deref(), Some("only-stdout\n"));
}

#[tokio::test]
async fn test_whitespace_stderr_is_still_the_error() {
    let res = runner()
        .run(sh("echo out; printf ' ' >&2; exit 1", Duration::from_secs(10)))
        .await;
    assert!(!res.success);
    assert_eq!(res.error.as_deref(), Some(" "));
}

#[tokio::test]
async fn test_env_overrides_are_merged() {
    let req = sh("echo \"$QUILL_TEST_VAR:${HOME:+home}\"", Duration::from_secs(10))
        .env("QUILL_TEST_VAR", "fromcaller");
    let res = runner().run(req).await;
    assert!(res.success);
    let out = res.output.unwrap_or_default();
    assert!(out.starts_with("fromcaller:"));
}

#[tokio::test]
async fn test_stdin_is_not_connected() {
    // `cat` on a null stdin sees EOF immediately instead of hanging.
    let res = runner().run(RunRequest::new("cat", Duration::from_secs(5))).await;
    assert!(res.success);
    assert!(!res.timed_out);
}

#[tokio::test]
async fn test_spawn_error_is_a_failed_result() {
    let res = runner()
        .run(RunRequest::new("/definitely/not/a/binary", Duration::from_secs(5)))
        .await;
    assert!(!res.success);
    assert!(res.message.contains("/definitely/not/a/binary"));
    assert!(res.error.is_some());
}

#[tokio::test]
async fn test_output_is_capped() {
    let config = RunnerConfig {
        max_output_bytes: 1024,
        ..RunnerConfig::default()
    };
    let runner = ProcessRunner::new(config, Arc::new(NoRedaction));
    let res = runner
        .run(sh("head -c 200000 /dev/zero | tr '\\0' 'a'", Duration::from_secs(10)))
        .await;
    assert!(res.success);
    assert_eq!(res.output.map(|o| o.len()), Some(1024));
    assert!(res.truncated);
}

#[tokio::test]
async fn test_output_is_redacted() {
    let res = runner()
        .run(sh("echo GITHUB_TOKEN=abcdef123; echo password=hunter22 >&2; exit 1", Duration::from_secs(10)))
        .await;
    let error = res.error.unwrap_or_default();
    let output = res.output.unwrap_or_default();
    assert!(!error.contains("hunter22"));
    assert!(!output.contains("abcdef123"));
}

#[tokio::test]
async fn test_timeout_resolves_after_graceful_signal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("term");
    let script = format!(
        "trap 'echo got > {}; exit 0' TERM; while true; do sleep 0.1; done",
        marker.display()
    );

    let started = Instant::now();
    let res = runner().run(sh(&script, Duration::from_millis(500))).await;
    assert!(!res.success);
    assert!(res.timed_out);
    assert!(res.message.contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The handler runs once the shell's current `sleep` returns.
    let mut seen = false;
    for _ in 0..50 {
        if marker.exists() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(seen, "process never received the termination signal");
}

#[tokio::test]
async fn test_timeout_escalates_to_kill() {
    let config = RunnerConfig {
        kill_grace: Duration::from_millis(300),
        await_termination: true,
        ..RunnerConfig::default()
    };
    let runner = ProcessRunner::new(config, Arc::new(NoRedaction));
    let started = Instant::now();
    // Ignores TERM; only the forced kill ends it.
    let res = runner
        .run(sh("trap '' TERM; sleep 30", Duration::from_millis(300)))
        .await;
    assert!(res.timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_direct_supervisor_kills_on_timeout() {
    let config = RunnerConfig {
        kill_grace: Duration::from_millis(200),
        await_termination: true,
        ..RunnerConfig::default()
    };
    let runner = ProcessRunner::new(config, Arc::new(NoRedaction))
        .with_supervisor(Arc::new(DirectSupervisor));
    let started = Instant::now();
    let res = runner.run(RunRequest::new("sleep", Duration::from_millis(200)).arg("30")).await;
    assert!(res.timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_terminate_reports_how_the_process_ended() {
    let supervisor = ProcessGroupSupervisor;

    let mut cmd = Command::new("true");
    supervisor.prepare(&mut cmd);
    let mut done = cmd.spawn().unwrap();
    let pid = done.id().unwrap();
    done.wait().await.unwrap();
    assert_eq!(
        supervisor.terminate(&mut done, pid, Duration::from_millis(100)).await,
        Termination::AlreadyExited
    );

    let mut cmd = Command::new("sleep");
    cmd.arg("30");
    supervisor.prepare(&mut cmd);
    let mut sleeper = cmd.spawn().unwrap();
    let pid = sleeper.id().unwrap();
    assert_eq!(
        supervisor.terminate(&mut sleeper, pid, Duration::from_secs(5)).await,
        Termination::Graceful
    );

    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "trap '' TERM; sleep 30"]);
    supervisor.prepare(&mut cmd);
    let mut stubborn = cmd.spawn().unwrap();
    let pid = stubborn.id().unwrap();
    // Let the shell install its trap first.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        supervisor.terminate(&mut stubborn, pid, Duration::from_millis(300)).await,
        Termination::Forced
    );
}

/// Last value written by the background counter in `dir/beat`.
fn read_beat(dir: &std::path::Path) -> String {
    std::fs::read_to_string(dir.join("beat")).unwrap_or_default()
}

#[tokio::test]
async fn test_timeout_stops_group_after_leader_exits() {
    let dir = tempfile::tempdir().unwrap();
    let beat = dir.path().join("beat");
    // The shell exits at once; the background loop keeps stdout open.
    let script = format!(
        "i=0; while true; do i=$((i+1)); echo $i > {}; sleep 0.05; done & exit 0",
        beat.display()
    );
    let config = RunnerConfig {
        kill_grace: Duration::from_millis(200),
        await_termination: true,
        ..RunnerConfig::default()
    };
    let runner = ProcessRunner::new(config, Arc::new(NoRedaction));

    let res = runner.run(sh(&script, Duration::from_millis(500))).await;
    assert!(res.timed_out);
    assert!(beat.exists());

    let settled = read_beat(dir.path());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(read_beat(dir.path()), settled, "background loop survived the timeout");
}
