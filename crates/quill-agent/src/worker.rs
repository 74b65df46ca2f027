use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use quill_core::{queue::TaskQueue, types::Task, TaskPatch};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    model::{ChatModel, Sampling},
    prompt::build_stage_prompt,
};

#[derive(Debug)]
pub enum WorkOutcome {
    /// Nothing was eligible.
    Idle,
    Completed(Task),
    /// The model call failed; `requeued` says whether retry budget remained.
    Failed { task: Task, requeued: bool },
}

/// Pulls eligible pipeline tasks and runs each stage through a chat model.
pub struct Worker {
    queue: TaskQueue,
    model: Arc<dyn ChatModel>,
    sampling: Sampling,
    role: Option<String>,
}

impl Worker {
    pub fn new(queue: TaskQueue, model: Arc<dyn ChatModel>) -> Self {
        Self {
            queue,
            model,
            sampling: Sampling::default(),
            role: None,
        }
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Only claim tasks assigned to `role`.
    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    /// Claim one task and work it to `completed` or `failed`.
    pub async fn run_once(&self) -> Result<WorkOutcome> {
        let Some(task) = self.queue.claim_next_task(self.role.as_deref()).await? else {
            return Ok(WorkOutcome::Idle);
        };
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            issue = ?task.issue_number,
            "working task"
        );

        let upstream = self.upstream(&task).await?;
        let messages = build_stage_prompt(&task, &upstream);

        match self.model.complete(&messages, self.sampling).await {
            Ok(text) => {
                let output = json!({ "content": text, "model": self.model.name() });
                let updated = self
                    .queue
                    .update_task(&task.id, TaskPatch::completed(output))
                    .await?;
                info!(task_id = %task.id, "task completed");
                Ok(WorkOutcome::Completed(updated.unwrap_or(task)))
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(task_id = %task.id, "stage failed: {reason}");
                let failed = self
                    .queue
                    .update_task(&task.id, TaskPatch::failed(reason))
                    .await?
                    .unwrap_or(task);
                match self.queue.retry_task(&failed.id).await? {
                    Some(requeued) => Ok(WorkOutcome::Failed {
                        task: requeued,
                        requeued: true,
                    }),
                    None => {
                        error!(task_id = %failed.id, "task failed permanently");
                        Ok(WorkOutcome::Failed {
                            task: failed,
                            requeued: false,
                        })
                    }
                }
            }
        }
    }

    /// Every task `task` transitively depends on, farthest first. A stage
    /// sees the whole chain: refine needs the draft as well as the review.
    async fn upstream(&self, task: &Task) -> Result<Vec<Task>> {
        let mut seen = HashSet::new();
        let mut pending: Vec<String> = task.depends_on.iter().rev().cloned().collect();
        let mut found = Vec::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(dep) = self.queue.get_task(&id).await? {
                pending.extend(dep.depends_on.iter().rev().cloned());
                found.push(dep);
            }
        }
        found.reverse();
        Ok(found)
    }

    /// Work tasks forever. Sleeps `poll` when nothing is eligible and after a
    /// failed stage, so a requeued task is not retried back to back.
    pub async fn run(self, poll: Duration) {
        info!(role = ?self.role, model = %self.model.name(), "stage worker started");
        loop {
            match self.run_once().await {
                Ok(WorkOutcome::Idle | WorkOutcome::Failed { .. }) => tokio::time::sleep(poll).await,
                Ok(WorkOutcome::Completed(_)) => {}
                Err(e) => {
                    warn!("worker iteration failed: {e:#}");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }
}
