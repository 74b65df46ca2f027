//! Repository event routing: each recognised event runs exactly one script.
//!
//! Routing is a pure function of the event name and payload. Execution uses
//! its own [`ProcessRunner`] and does not compete for the dispatcher's slots.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    history::ExecutionHistory,
    jobs::{
        JobKind, JobRegistry, SCRIPT_FEEDBACK, SCRIPT_GENERATE, SCRIPT_PUBLISH,
        SCRIPT_REVIEW_AND_FIX, SCRIPT_UNPUBLISH,
    },
    runner::{ProcessRunner, RunRequest, RunResult},
    types::ExecutionRecord,
};

pub const LABEL_REQUEST: &str = "request";
pub const LABEL_INVALID: &str = "invalid";
pub const LABEL_DRAFT: &str = "draft";
pub const LABEL_PUBLISHED: &str = "published";

/// Comment authors whose feedback is acted on.
pub const TRUSTED_ASSOCIATIONS: &[&str] = &["OWNER", "MEMBER", "COLLABORATOR"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptAction {
    pub script: &'static str,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    Run(ScriptAction),
    /// Acknowledged, nothing to do. Carries the reason for the log line.
    Ignore(String),
}

fn issue_labels(payload: &Value) -> Vec<&str> {
    payload
        .pointer("/issue/labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn run_with(script: &'static str, issue: u64, extra: &[(&str, String)]) -> WebhookAction {
    let mut env = BTreeMap::new();
    env.insert("ISSUE_NUMBER".to_string(), issue.to_string());
    for (k, v) in extra {
        env.insert(k.to_string(), v.clone());
    }
    WebhookAction::Run(ScriptAction { script, env })
}

/// Decide what, if anything, an event triggers.
pub fn route(event: &str, payload: &Value) -> WebhookAction {
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    let Some(issue) = payload.pointer("/issue/number").and_then(Value::as_u64) else {
        return WebhookAction::Ignore(format!("{event}/{action}: no issue number"));
    };

    match (event, action) {
        ("issues", "labeled") => {
            let label = payload.pointer("/label/name").and_then(Value::as_str).unwrap_or("");
            let script = match label {
                LABEL_REQUEST => SCRIPT_GENERATE,
                LABEL_INVALID => SCRIPT_REVIEW_AND_FIX,
                other => return WebhookAction::Ignore(format!("label '{other}' has no handler")),
            };
            run_with(script, issue, &[("LABEL_NAME", label.to_string())])
        }
        ("issues", "closed") => {
            if issue_labels(payload).contains(&LABEL_DRAFT) {
                run_with(SCRIPT_PUBLISH, issue, &[])
            } else {
                WebhookAction::Ignore(format!("issue #{issue} closed without '{LABEL_DRAFT}'"))
            }
        }
        ("issues", "reopened") => {
            if issue_labels(payload).contains(&LABEL_PUBLISHED) {
                run_with(SCRIPT_UNPUBLISH, issue, &[])
            } else {
                WebhookAction::Ignore(format!("issue #{issue} reopened without '{LABEL_PUBLISHED}'"))
            }
        }
        ("issue_comment", "created") => {
            let association = payload
                .pointer("/comment/author_association")
                .and_then(Value::as_str)
                .unwrap_or("NONE");
            if !TRUSTED_ASSOCIATIONS.contains(&association) {
                return WebhookAction::Ignore(format!("comment by {association} ignored"));
            }
            let mut extra = Vec::new();
            if let Some(id) = payload.pointer("/comment/id").and_then(Value::as_u64) {
                extra.push(("COMMENT_ID", id.to_string()));
            }
            run_with(SCRIPT_FEEDBACK, issue, &extra)
        }
        _ => WebhookAction::Ignore(format!("{event}/{action} not handled")),
    }
}

/// What the endpoint reports back to the sender.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub handled: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

impl WebhookResponse {
    fn ignored(message: String) -> Self {
        Self {
            handled: false,
            message,
            script: None,
            result: None,
        }
    }
}

pub struct WebhookRouter {
    registry: Arc<JobRegistry>,
    runner: ProcessRunner,
    history: Option<Arc<ExecutionHistory>>,
    default_timeout: Duration,
}

impl WebhookRouter {
    pub fn new(registry: Arc<JobRegistry>, runner: ProcessRunner, default_timeout: Duration) -> Self {
        Self {
            registry,
            runner,
            history: None,
            default_timeout,
        }
    }

    pub fn with_history(mut self, history: Arc<ExecutionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Route and, if routed, run the script to completion or timeout.
    pub async fn handle(&self, event: &str, payload: &Value) -> WebhookResponse {
        let action = match route(event, payload) {
            WebhookAction::Run(a) => a,
            WebhookAction::Ignore(reason) => {
                info!(event, "webhook ignored: {reason}");
                return WebhookResponse::ignored(reason);
            }
        };

        let Some(spec) = self.registry.get(JobKind::Script, action.script) else {
            warn!(event, script = action.script, "routed script is not registered");
            return WebhookResponse::ignored(format!("script {} is not registered", action.script));
        };

        info!(event, script = action.script, env = ?action.env, "webhook dispatch");
        let started_at = Utc::now();
        let result = self
            .runner
            .run(RunRequest {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env: action.env,
                timeout: spec.timeout(self.default_timeout),
            })
            .await;

        if let Some(history) = &self.history {
            history
                .record(ExecutionRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    job_name: spec.key(),
                    started_at,
                    completed_at: Utc::now(),
                    success: result.success,
                    message: result.message.clone(),
                    duration: result.duration_ms,
                    error: result.error.clone(),
                })
                .await;
        }

        WebhookResponse {
            handled: true,
            message: result.message.clone(),
            script: Some(action.script.to_string()),
            result: Some(result),
        }
    }
}
