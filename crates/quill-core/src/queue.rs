//! Persistent, dependency-aware task queue.
//!
//! One actor task owns the in-memory [`TaskList`] and the [`TaskStore`].
//! Every request arrives over an mpsc channel and is answered on a oneshot,
//! so mutations are applied strictly one at a time and each is flushed to
//! disk before the caller hears back. [`TaskQueue`] is the cloneable handle.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    graph,
    store::TaskStore,
    types::{NewTask, QueueStats, Task, TaskList, TaskPatch, TaskStatus, DEFAULT_MAX_RETRIES},
};

pub const DEFAULT_STALE_MINUTES: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("dependency {0} does not exist")]
    UnknownDependency(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("task store: {0:#}")]
    Store(anyhow::Error),
    #[error("task queue is shut down")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

enum Request {
    Load(oneshot::Sender<TaskList>),
    Save(TaskList, Reply<()>),
    Create(NewTask, Reply<Task>),
    Update(String, TaskPatch, Reply<Option<Task>>),
    Get(String, oneshot::Sender<Option<Task>>),
    Next {
        role: Option<String>,
        claim: bool,
        reply: Reply<Option<Task>>,
    },
    Retry(String, Reply<Option<Task>>),
    Cleanup(u64, Reply<usize>),
    ByIssue(u64, oneshot::Sender<Vec<Task>>),
    Stats(oneshot::Sender<QueueStats>),
}

// ── Handle ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Request>,
}

impl TaskQueue {
    /// Load the store and spawn the owning actor on the current runtime.
    pub async fn open(store: TaskStore) -> Self {
        let list = store.load().await;
        if let Some(cycle) = graph::find_task_cycle(&list.tasks) {
            warn!(
                "task store contains a dependency cycle ({}); those tasks will never become eligible",
                cycle.join(" -> ")
            );
        }
        info!(
            path = %store.path().display(),
            tasks = list.tasks.len(),
            "task queue opened"
        );
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(QueueActor { store, list }.run(rx));
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| QueueError::Closed)?;
        reply_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Snapshot of the whole task list.
    pub async fn load(&self) -> Result<TaskList, QueueError> {
        self.call(Request::Load).await
    }

    /// Replace the whole task list and persist it.
    pub async fn save(&self, list: TaskList) -> Result<(), QueueError> {
        self.call(|r| Request::Save(list, r)).await?
    }

    pub async fn create_task(&self, spec: NewTask) -> Result<Task, QueueError> {
        self.call(|r| Request::Create(spec, r)).await?
    }

    /// Merge `patch` into task `id`. `Ok(None)` when the id is unknown.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        self.call(|r| Request::Update(id, patch, r)).await?
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        self.call(|r| Request::Get(id, r)).await
    }

    /// Highest-priority pending task whose dependencies are all completed.
    /// Does not claim it: a concurrent caller may receive the same task.
    pub async fn get_next_task(&self, role: Option<&str>) -> Result<Option<Task>, QueueError> {
        let role = role.map(str::to_string);
        self.call(|reply| Request::Next { role, claim: false, reply })
            .await?
    }

    /// Same selection as [`get_next_task`](Self::get_next_task), but the chosen
    /// task is marked `in_progress` before any other request is served.
    pub async fn claim_next_task(&self, role: Option<&str>) -> Result<Option<Task>, QueueError> {
        let role = role.map(str::to_string);
        self.call(|reply| Request::Next { role, claim: true, reply })
            .await?
    }

    /// Re-queue a failed task with budget left. `Ok(None)` on any unmet precondition.
    pub async fn retry_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        self.call(|r| Request::Retry(id, r)).await?
    }

    /// Fail every `in_progress` task created more than `timeout_minutes` ago.
    ///
    /// Age is measured from `created_at`, not from the last sign of life: a
    /// long but healthy task past the threshold is failed as well.
    pub async fn cleanup_stale_tasks(&self, timeout_minutes: u64) -> Result<usize, QueueError> {
        self.call(|r| Request::Cleanup(timeout_minutes, r)).await?
    }

    pub async fn get_tasks_by_issue(&self, issue_number: u64) -> Result<Vec<Task>, QueueError> {
        self.call(|r| Request::ByIssue(issue_number, r)).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.call(Request::Stats).await
    }
}

// ── Actor ────────────────────────────────────────────────────────────────

struct QueueActor {
    store: TaskStore,
    list: TaskList,
}

impl QueueActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(req) = rx.recv().await {
            match req {
                Request::Load(reply) => {
                    let _ = reply.send(self.list.clone());
                }
                Request::Save(list, reply) => {
                    let _ = reply.send(self.replace(list).await);
                }
                Request::Create(spec, reply) => {
                    let _ = reply.send(self.create(spec).await);
                }
                Request::Update(id, patch, reply) => {
                    let _ = reply.send(self.update(&id, patch).await);
                }
                Request::Get(id, reply) => {
                    let _ = reply.send(self.list.tasks.iter().find(|t| t.id == id).cloned());
                }
                Request::Next { role, claim, reply } => {
                    let _ = reply.send(self.next(role.as_deref(), claim).await);
                }
                Request::Retry(id, reply) => {
                    let _ = reply.send(self.retry(&id).await);
                }
                Request::Cleanup(minutes, reply) => {
                    let _ = reply.send(self.cleanup(minutes).await);
                }
                Request::ByIssue(issue, reply) => {
                    let tasks = self
                        .list
                        .tasks
                        .iter()
                        .filter(|t| t.issue_number == Some(issue))
                        .cloned()
                        .collect();
                    let _ = reply.send(tasks);
                }
                Request::Stats(reply) => {
                    let _ = reply.send(QueueStats::from_tasks(&self.list.tasks));
                }
            }
        }
        debug!("task queue actor stopped");
    }

    /// Flush the current list; on failure restore `snapshot` so memory matches disk.
    async fn persist(&mut self, snapshot: TaskList) -> Result<(), QueueError> {
        if let Err(e) = self.store.save(&mut self.list).await {
            warn!("task store save failed, rolling back in-memory change: {e:#}");
            self.list = snapshot;
            return Err(QueueError::Store(e));
        }
        Ok(())
    }

    /// Whole-list writes obey the same dependency rules as single changes.
    async fn replace(&mut self, list: TaskList) -> Result<(), QueueError> {
        let ids: HashSet<&str> = list.tasks.iter().map(|t| t.id.as_str()).collect();
        if let Some(missing) = list
            .tasks
            .iter()
            .flat_map(|t| &t.depends_on)
            .find(|d| !ids.contains(d.as_str()))
        {
            return Err(QueueError::UnknownDependency(missing.clone()));
        }
        if let Some(cycle) = graph::find_task_cycle(&list.tasks) {
            return Err(QueueError::DependencyCycle(cycle));
        }
        let snapshot = std::mem::replace(&mut self.list, list);
        self.persist(snapshot).await
    }

    fn check_known(&self, deps: &[String]) -> Result<(), QueueError> {
        match deps
            .iter()
            .find(|d| !self.list.tasks.iter().any(|t| &t.id == *d))
        {
            Some(missing) => Err(QueueError::UnknownDependency(missing.clone())),
            None => Ok(()),
        }
    }

    async fn create(&mut self, spec: NewTask) -> Result<Task, QueueError> {
        self.check_known(&spec.depends_on)?;

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: spec.task_type,
            status: TaskStatus::Pending,
            priority: spec.priority.unwrap_or_default(),
            issue_number: spec.issue_number,
            document_slug: spec.document_slug,
            parent_task_id: spec.parent_task_id,
            depends_on: spec.depends_on,
            input: spec.input,
            output: None,
            assigned_agent: spec.assigned_agent,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            error: None,
        };

        let snapshot = self.list.clone();
        self.list.tasks.push(task.clone());
        self.persist(snapshot).await?;

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            issue = ?task.issue_number,
            "created task"
        );
        Ok(task)
    }

    async fn update(&mut self, id: &str, patch: TaskPatch) -> Result<Option<Task>, QueueError> {
        let Some(idx) = self.list.tasks.iter().position(|t| t.id == id) else {
            warn!(task_id = %id, "update_task: no such task");
            return Ok(None);
        };

        if let Some(deps) = &patch.depends_on {
            self.check_known(deps)?;
            if let Some(cycle) = graph::cycle_with_deps(&self.list.tasks, id, deps) {
                return Err(QueueError::DependencyCycle(cycle));
            }
        }

        let snapshot = self.list.clone();
        let now = Utc::now();
        let task = &mut self.list.tasks[idx];
        let previous = task.status;

        if let Some(status) = patch.status {
            if status == TaskStatus::Completed && previous != TaskStatus::Completed {
                task.completed_at = Some(now);
            }
            if status == TaskStatus::InProgress && previous != TaskStatus::InProgress {
                task.started_at = Some(now);
            }
            task.status = status;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(slug) = patch.document_slug {
            task.document_slug = Some(slug);
        }
        if let Some(deps) = patch.depends_on {
            task.depends_on = deps;
        }
        if let Some(input) = patch.input {
            task.input = input;
        }
        if let Some(output) = patch.output {
            task.output = Some(output);
        }
        if let Some(agent) = patch.assigned_agent {
            task.assigned_agent = Some(agent);
        }
        if let Some(max) = patch.max_retries {
            task.max_retries = max;
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        let updated = task.clone();

        self.persist(snapshot).await?;
        if previous != updated.status {
            info!(task_id = %id, from = %previous, to = %updated.status, "task status changed");
        }
        Ok(Some(updated))
    }

    /// Index of the next eligible task: pending, role-matched, every
    /// dependency completed; lowest priority rank, ties in store order.
    fn select_next(&self, role: Option<&str>) -> Option<usize> {
        let completed: HashSet<&str> = self
            .list
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        let mut candidates: Vec<(usize, &Task)> = self
            .list
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .filter(|(_, t)| match role {
                Some(role) => t.assigned_agent.as_deref() == Some(role),
                None => true,
            })
            .filter(|(_, t)| t.depends_on.iter().all(|d| completed.contains(d.as_str())))
            .collect();

        // Stable sort: equal priorities keep insertion order.
        candidates.sort_by_key(|(_, t)| t.priority.rank());
        candidates.first().map(|(idx, _)| *idx)
    }

    async fn next(&mut self, role: Option<&str>, claim: bool) -> Result<Option<Task>, QueueError> {
        let Some(idx) = self.select_next(role) else {
            return Ok(None);
        };
        if !claim {
            return Ok(Some(self.list.tasks[idx].clone()));
        }

        let snapshot = self.list.clone();
        let task = &mut self.list.tasks[idx];
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        let claimed = task.clone();
        self.persist(snapshot).await?;

        info!(
            task_id = %claimed.id,
            task_type = %claimed.task_type,
            role = ?role,
            "claimed task"
        );
        Ok(Some(claimed))
    }

    async fn retry(&mut self, id: &str) -> Result<Option<Task>, QueueError> {
        let Some(idx) = self.list.tasks.iter().position(|t| t.id == id) else {
            warn!(task_id = %id, "retry_task: no such task");
            return Ok(None);
        };
        let current = &self.list.tasks[idx];
        if !current.can_retry() {
            warn!(
                task_id = %id,
                status = %current.status,
                retry_count = current.retry_count,
                max_retries = current.max_retries,
                "retry_task: task is not failed or its retry budget is spent"
            );
            return Ok(None);
        }

        let snapshot = self.list.clone();
        let task = &mut self.list.tasks[idx];
        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.error = None;
        task.completed_at = None;
        task.started_at = None;
        let retried = task.clone();
        self.persist(snapshot).await?;

        info!(
            task_id = %id,
            attempt = retried.retry_count,
            max_retries = retried.max_retries,
            "task re-queued"
        );
        Ok(Some(retried))
    }

    async fn cleanup(&mut self, timeout_minutes: u64) -> Result<usize, QueueError> {
        let now = Utc::now();
        let Some(cutoff) = i64::try_from(timeout_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let stale: Vec<usize> = self
            .list
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::InProgress && t.created_at < cutoff)
            .map(|(i, _)| i)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let snapshot = self.list.clone();
        for &idx in &stale {
            let task = &mut self.list.tasks[idx];
            task.status = TaskStatus::Failed;
            task.error = Some(format!(
                "Task timed out: in progress for more than {timeout_minutes} minutes"
            ));
            task.completed_at = Some(now);
            warn!(task_id = %task.id, task_type = %task.task_type, "stale task marked failed");
        }
        self.persist(snapshot).await?;
        Ok(stale.len())
    }
}
