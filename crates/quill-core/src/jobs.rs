//! Named jobs and scripts the dispatcher may run, resolved once at startup.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Job,
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Caller-supplied env names this job accepts; everything else is dropped.
    #[serde(default)]
    pub allowed_env: Vec<String>,
    /// Must be present after filtering or the invocation is rejected.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Run on a fixed interval from the server's scheduler.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl JobSpec {
    /// Registry key, also the name recorded in execution history.
    pub fn key(&self) -> String {
        registry_key(self.kind, &self.name)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

pub fn registry_key(kind: JobKind, name: &str) -> String {
    match kind {
        JobKind::Job => name.to_string(),
        JobKind::Script => format!("script:{name}"),
    }
}

// ── Built-ins ────────────────────────────────────────────────────────────

pub const SCRIPT_GENERATE: &str = "generate-document";
pub const SCRIPT_REVIEW_AND_FIX: &str = "review-and-fix";
pub const SCRIPT_PUBLISH: &str = "publish-document";
pub const SCRIPT_UNPUBLISH: &str = "unpublish-document";
pub const SCRIPT_FEEDBACK: &str = "process-feedback";
pub const SCRIPT_MARK_INVALID: &str = "mark-invalid";

/// (name, description, allowed env, required env)
const BUILTIN_SCRIPTS: &[(&str, &str, &[&str], &[&str])] = &[
    (
        SCRIPT_GENERATE,
        "Generate a document from a request issue",
        &["ISSUE_NUMBER", "LABEL_NAME", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
    (
        SCRIPT_REVIEW_AND_FIX,
        "Review an invalid request and propose fixes",
        &["ISSUE_NUMBER", "LABEL_NAME", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
    (
        SCRIPT_PUBLISH,
        "Publish a draft document",
        &["ISSUE_NUMBER", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
    (
        SCRIPT_UNPUBLISH,
        "Move a published document back to draft",
        &["ISSUE_NUMBER", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
    (
        SCRIPT_FEEDBACK,
        "Apply maintainer feedback from an issue comment",
        &["ISSUE_NUMBER", "COMMENT_ID", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
    (
        SCRIPT_MARK_INVALID,
        "Label a request issue as invalid",
        &["ISSUE_NUMBER", "DRY_RUN"],
        &["ISSUE_NUMBER"],
    ),
];

/// (name, description, interval seconds)
const BUILTIN_JOBS: &[(&str, &str, Option<u64>)] = &[
    ("process-requests", "Pick up new request issues", Some(15 * 60)),
    ("check-links", "Verify outbound links in published documents", Some(24 * 60 * 60)),
    ("rebuild-index", "Regenerate the documentation search index", None),
];

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    specs: HashMap<String, JobSpec>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in scripts and jobs, each run as `<runtime> <scripts_dir>/<name>.js`.
    pub fn builtin(scripts_dir: &Path, runtime: &str) -> Self {
        let script_path = |name: &str| -> String {
            scripts_dir.join(format!("{name}.js")).to_string_lossy().into_owned()
        };
        let mut reg = Self::new();
        for &(name, description, allowed, required) in BUILTIN_SCRIPTS {
            reg.insert(JobSpec {
                name: name.to_string(),
                kind: JobKind::Script,
                command: runtime.to_string(),
                args: vec![script_path(name)],
                description: description.to_string(),
                allowed_env: allowed.iter().map(|s| s.to_string()).collect(),
                required_env: required.iter().map(|s| s.to_string()).collect(),
                timeout_secs: None,
                interval_secs: None,
            });
        }
        for &(name, description, interval) in BUILTIN_JOBS {
            reg.insert(JobSpec {
                name: name.to_string(),
                kind: JobKind::Job,
                command: runtime.to_string(),
                args: vec![script_path(&format!("jobs/{name}"))],
                description: description.to_string(),
                allowed_env: vec!["DRY_RUN".to_string()],
                required_env: Vec::new(),
                timeout_secs: None,
                interval_secs: interval,
            });
        }
        reg
    }

    /// Add or replace entries from a JSON array of [`JobSpec`]. A missing file
    /// is not an error.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let specs: Vec<JobSpec> =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        let n = specs.len();
        for spec in specs {
            self.insert(spec);
        }
        info!(path = %path.display(), "loaded {n} job definitions");
        Ok(n)
    }

    pub fn insert(&mut self, spec: JobSpec) -> Option<JobSpec> {
        self.specs.insert(spec.key(), spec)
    }

    pub fn get(&self, kind: JobKind, name: &str) -> Option<&JobSpec> {
        self.specs.get(&registry_key(kind, name))
    }

    /// All entries sorted by kind then name.
    pub fn list(&self) -> Vec<&JobSpec> {
        let mut all: Vec<&JobSpec> = self.specs.values().collect();
        all.sort_by(|a, b| (a.kind == JobKind::Script, &a.name).cmp(&(b.kind == JobKind::Script, &b.name)));
        all
    }

    pub fn scheduled(&self) -> Vec<(&JobSpec, Duration)> {
        self.list()
            .into_iter()
            .filter_map(|s| s.interval().map(|d| (s, d)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Default location for job definition overrides.
pub fn default_jobs_file(data_dir: &Path) -> PathBuf {
    data_dir.join("jobs.json")
}
