//! Bounded, time-limited execution of one external command.

use std::{
    collections::BTreeMap,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::{
    redact::Redactor,
    supervisor::{default_supervisor, Supervisor},
};

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);
pub const SUCCESS_MESSAGE: &str = "Script completed successfully";

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the inherited parent environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Either stream hit the byte cap.
    pub truncated: bool,
}

impl RunResult {
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    /// Hold the timeout result until the process is actually gone.
    pub await_termination: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
            await_termination: false,
        }
    }
}

#[derive(Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
    supervisor: Arc<dyn Supervisor>,
    redactor: Arc<dyn Redactor>,
}

/// Captured bytes from one stream plus whether anything was dropped.
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `reader` to EOF keeping at most `cap` bytes. The rest is drained so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Capture {
    let mut cap_out = Capture::default();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(cap_out.bytes.len());
                if n > room {
                    cap_out.truncated = true;
                }
                cap_out.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!("output stream read error: {e}");
                break;
            }
        }
    }
    cap_out
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig, redactor: Arc<dyn Redactor>) -> Self {
        Self {
            config,
            supervisor: default_supervisor(),
            redactor,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Run to completion or timeout. Never returns an error: every failure
    /// mode is a `RunResult` with `success == false`.
    pub async fn run(&self, req: RunRequest) -> RunResult {
        let started = Instant::now();
        let mut result = self.execute(&req).await;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.output = result.output.map(|o| self.redactor.redact(&o));
        result.error = result.error.map(|e| self.redactor.redact(&e));

        if result.success {
            info!(
                command = %req.command,
                duration_ms = result.duration_ms,
                "process finished"
            );
        } else {
            warn!(
                command = %req.command,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                duration_ms = result.duration_ms,
                "process failed: {}",
                result.message
            );
        }
        result
    }

    async fn execute(&self, req: &RunRequest) -> RunResult {
        let mut cmd = Command::new(&req.command);
        cmd.args(&req.args)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.supervisor.prepare(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return RunResult::failure(format!("Failed to start {}", req.command), e.to_string())
            }
        };
        // Kept for the timeout path: the leader may be reaped before its group is.
        let Some(pid) = child.id() else {
            return RunResult::failure(
                format!("Failed to start {}", req.command),
                "process exited before its id could be read",
            );
        };
        debug!(command = %req.command, pid, "spawned");

        let cap = self.config.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(async move {
            match stdout {
                Some(s) => read_capped(s, cap).await,
                None => Capture::default(),
            }
        });
        let err_task = tokio::spawn(async move {
            match stderr {
                Some(s) => read_capped(s, cap).await,
                None => Capture::default(),
            }
        });

        // Completion means exit plus both pipes closed; whichever of that
        // and the deadline comes first decides the result.
        let finished = {
            let completion = async {
                let status = child.wait().await;
                let out = out_task.await.unwrap_or_default();
                let err = err_task.await.unwrap_or_default();
                (status, out, err)
            };
            tokio::select! {
                done = completion => Some(done),
                _ = tokio::time::sleep(req.timeout) => None,
            }
        };

        let Some((status, out, err)) = finished else {
            if let Err(e) = self.supervisor.graceful_stop(pid) {
                warn!(command = %req.command, "graceful stop failed: {e}");
            }
            let secs = req.timeout.as_secs_f64();
            let mut result = RunResult::failure(
                format!("Script timed out after {secs}s"),
                format!("process exceeded its {secs}s timeout and was sent a termination signal"),
            );
            result.timed_out = true;

            let supervisor = self.supervisor.clone();
            let grace = self.config.kill_grace;
            let command = req.command.clone();
            let escalation = async move {
                let outcome = supervisor.escalate(&mut child, pid, grace).await;
                debug!(%command, ?outcome, "timed-out process reaped");
            };
            if self.config.await_termination {
                escalation.await;
            } else {
                tokio::spawn(escalation);
            }
            return result;
        };

        let status = match status {
            Ok(s) => s,
            Err(e) => return RunResult::failure(format!("Failed to wait for {}", req.command), e.to_string()),
        };
        let stdout = out.text();
        let stderr = err.text();
        let truncated = out.truncated || err.truncated;

        if status.success() {
            return RunResult {
                success: true,
                message: SUCCESS_MESSAGE.to_string(),
                output: Some(stdout),
                exit_code: Some(0),
                truncated,
                ..Default::default()
            };
        }

        let message = match status.code() {
            Some(code) => format!("Script exited with code {code}"),
            None => signal_message(&status),
        };
        let error = if stderr.is_empty() { stdout.clone() } else { stderr };
        RunResult {
            success: false,
            message,
            output: (!stdout.is_empty()).then_some(stdout),
            error: Some(error),
            exit_code: status.code(),
            truncated,
            ..Default::default()
        }
    }
}

#[cfg(unix)]
fn signal_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("Script terminated by signal {sig}"),
        None => "Script terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_message(_status: &std::process::ExitStatus) -> String {
    "Script terminated abnormally".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_capped_keeps_prefix_and_flags_truncation() {
        let data = vec![b'x'; 20_000];
        let cap = read_capped(&data[..], 100).await;
        assert_eq!(cap.bytes.len(), 100);
        assert!(cap.truncated);
    }

    #[tokio::test]
    async fn read_capped_under_limit_is_untouched() {
        let cap = read_capped(&b"hello"[..], 100).await;
        assert_eq!(cap.text(), "hello");
        assert!(!cap.truncated);
    }
}
