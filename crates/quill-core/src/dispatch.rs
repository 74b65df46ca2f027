//! Policy layer over the process runner: per-name exclusion, a global
//! concurrency ceiling, env whitelisting, and execution history.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    history::ExecutionHistory,
    jobs::{registry_key, JobKind, JobRegistry, JobSpec},
    runner::{ProcessRunner, RunRequest, RunResult},
    types::ExecutionRecord,
};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Rejections decided before anything is spawned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("too many scripts running (limit {0}), try again later")]
    RateLimited(usize),
    #[error("{name} requires environment variable(s): {}", missing.join(", "))]
    MissingEnv { name: String, missing: Vec<String> },
}

/// Caller-side parameters of one invocation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl Invocation {
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Response body of a job or script invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub script_name: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub duration: u64,
}

impl DispatchOutcome {
    fn new(name: &str, result: RunResult) -> Self {
        Self {
            script_name: name.to_string(),
            success: result.success,
            message: result.message,
            output: result.output,
            error: result.error,
            duration: result.duration_ms,
        }
    }
}

/// `^[A-Za-z0-9._-]+$`
pub fn is_safe_env_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Keep only whitelisted names whose values pass [`is_safe_env_value`].
/// Anything else is dropped without error.
pub fn filter_env(spec: &JobSpec, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    overrides
        .iter()
        .filter(|(name, value)| {
            let keep = spec.allowed_env.iter().any(|a| a == *name) && is_safe_env_value(value);
            if !keep {
                info!(job = %spec.name, var = %name, "dropping env override");
            }
            keep
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

type RunningSet = Arc<Mutex<HashSet<String>>>;

fn lock_running(set: &RunningSet) -> MutexGuard<'_, HashSet<String>> {
    // The set holds plain strings; a poisoned lock still has a usable value.
    set.lock().unwrap_or_else(|p| p.into_inner())
}

/// Holds a name's slot; released on drop however the run ends.
struct RunningSlot {
    set: RunningSet,
    key: String,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        lock_running(&self.set).remove(&self.key);
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<JobRegistry>,
    runner: ProcessRunner,
    history: Arc<ExecutionHistory>,
    running: RunningSet,
    max_concurrent: usize,
    default_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        runner: ProcessRunner,
        history: Arc<ExecutionHistory>,
    ) -> Self {
        Self {
            registry,
            runner,
            history,
            running: Arc::new(Mutex::new(HashSet::new())),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Registry keys currently executing, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock_running(&self.running).iter().cloned().collect();
        keys.sort();
        keys
    }

    fn acquire(&self, key: &str) -> Result<RunningSlot, DispatchError> {
        let mut running = lock_running(&self.running);
        if running.contains(key) {
            return Err(DispatchError::AlreadyRunning(key.to_string()));
        }
        if running.len() >= self.max_concurrent {
            return Err(DispatchError::RateLimited(self.max_concurrent));
        }
        running.insert(key.to_string());
        Ok(RunningSlot {
            set: Arc::clone(&self.running),
            key: key.to_string(),
        })
    }

    /// Validate, claim a slot, run, record. `Err` means nothing was spawned;
    /// a process that ran and failed is `Ok` with `success == false`.
    pub async fn run(
        &self,
        kind: JobKind,
        name: &str,
        invocation: Invocation,
    ) -> Result<DispatchOutcome, DispatchError> {
        let spec = self
            .registry
            .get(kind, name)
            .ok_or_else(|| DispatchError::UnknownJob(registry_key(kind, name)))?;

        let mut env = filter_env(spec, &invocation.env);
        let missing: Vec<String> = spec
            .required_env
            .iter()
            .filter(|k| !env.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(job = %spec.key(), ?missing, "rejected: required env missing");
            return Err(DispatchError::MissingEnv {
                name: spec.key(),
                missing,
            });
        }
        if invocation.dry_run {
            env.insert("DRY_RUN".to_string(), "true".to_string());
        }

        let key = spec.key();
        let _slot = self.acquire(&key).inspect_err(|e| warn!(job = %key, "rejected: {e}"))?;
        info!(job = %key, dry_run = invocation.dry_run, "dispatching");

        let started_at = Utc::now();
        let result = self
            .runner
            .run(RunRequest {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env,
                timeout: spec.timeout(self.default_timeout),
            })
            .await;

        self.history
            .record(ExecutionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                job_name: key,
                started_at,
                completed_at: Utc::now(),
                success: result.success,
                message: result.message.clone(),
                duration: result.duration_ms,
                error: result.error.clone(),
            })
            .await;

        Ok(DispatchOutcome::new(name, result))
    }
}
