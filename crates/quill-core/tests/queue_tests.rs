use chrono::{Duration, Utc};
use quill_core::{
    queue::{QueueError, TaskQueue},
    store::TaskStore,
    NewTask, Priority, TaskPatch, TaskStatus, TaskType,
};
use serde_json::json;
use tempfile::TempDir;

async fn open_queue() -> (TempDir, TaskQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = TaskQueue::open(TaskStore::new(dir.path().join("tasks.json"))).await;
    (dir, queue)
}

fn task(task_type: TaskType) -> NewTask {
    NewTask::new(task_type)
}

fn task_after(task_type: TaskType, dep: &str) -> NewTask {
    let mut t = NewTask::new(task_type);
    t.depends_on = vec![dep.to_string()];
    t
}

#[tokio::test]
async fn test_missing_store_loads_empty() {
    let (_dir, queue) = open_queue().await;
    let list = queue.load().await.unwrap();
    assert!(list.tasks.is_empty());
}

#[tokio::test]
async fn test_corrupt_store_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(&path, "{ not json").unwrap();
    let queue = TaskQueue::open(TaskStore::new(&path)).await;
    assert!(queue.load().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn test_create_applies_defaults_and_persists() {
    let (dir, queue) = open_queue().await;
    let created = queue.create_task(task(TaskType::Research)).await.unwrap();

    assert_eq!(created.status, TaskStatus::Pending);
    assert_eq!(created.priority, Priority::Normal);
    assert_eq!(created.retry_count, 0);
    assert_eq!(created.max_retries, 2);
    assert!(created.completed_at.is_none());

    let raw = std::fs::read_to_string(dir.path().join("tasks.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["tasks"][0]["id"], json!(created.id));
    assert_eq!(doc["tasks"][0]["type"], json!("research"));
    assert_eq!(doc["tasks"][0]["status"], json!("pending"));
    assert!(doc["lastUpdated"].is_string());
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    let id = {
        let queue = TaskQueue::open(TaskStore::new(&path)).await;
        queue.create_task(task(TaskType::Write)).await.unwrap().id
    };
    let queue = TaskQueue::open(TaskStore::new(&path)).await;
    let found = queue.get_task(&id).await.unwrap().unwrap();
    assert_eq!(found.task_type, TaskType::Write);
}

#[tokio::test]
async fn test_create_rejects_unknown_dependency() {
    let (_dir, queue) = open_queue().await;
    let err = queue
        .create_task(task_after(TaskType::Outline, "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownDependency(ref id) if id == "ghost"));
    assert!(queue.load().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn test_update_unknown_id_is_none() {
    let (_dir, queue) = open_queue().await;
    let res = queue
        .update_task("nope", TaskPatch::status(TaskStatus::Completed))
        .await
        .unwrap();
    assert!(res.is_none());
}

#[tokio::test]
async fn test_completed_at_stamped_once() {
    let (_dir, queue) = open_queue().await;
    let t = queue.create_task(task(TaskType::Research)).await.unwrap();

    let first = queue
        .update_task(&t.id, TaskPatch::completed(json!({"content": "a"})))
        .await
        .unwrap()
        .unwrap();
    let stamp = first.completed_at.unwrap();

    let second = queue
        .update_task(&t.id, TaskPatch::completed(json!({"content": "b"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.completed_at, Some(stamp));
    assert_eq!(second.output, Some(json!({"content": "b"})));
}

#[tokio::test]
async fn test_update_rejects_cycle_and_leaves_store_unchanged() {
    let (_dir, queue) = open_queue().await;
    let a = queue.create_task(task(TaskType::Research)).await.unwrap();
    let b = queue.create_task(task_after(TaskType::Outline, &a.id)).await.unwrap();

    let patch = TaskPatch {
        depends_on: Some(vec![b.id.clone()]),
        ..TaskPatch::default()
    };
    let err = queue.update_task(&a.id, patch).await.unwrap_err();
    assert!(matches!(err, QueueError::DependencyCycle(_)));

    let a_now = queue.get_task(&a.id).await.unwrap().unwrap();
    assert!(a_now.depends_on.is_empty());
}

#[tokio::test]
async fn test_next_task_waits_for_dependencies() {
    let (_dir, queue) = open_queue().await;
    let a = queue.create_task(task(TaskType::Research)).await.unwrap();
    let b = queue.create_task(task_after(TaskType::Outline, &a.id)).await.unwrap();

    let next = queue.get_next_task(None).await.unwrap().unwrap();
    assert_eq!(next.id, a.id);

    queue
        .update_task(&a.id, TaskPatch::status(TaskStatus::InProgress))
        .await
        .unwrap();
    assert!(queue.get_next_task(None).await.unwrap().is_none());

    queue
        .update_task(&a.id, TaskPatch::completed(json!({})))
        .await
        .unwrap();
    let next = queue.get_next_task(None).await.unwrap().unwrap();
    assert_eq!(next.id, b.id);
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let (_dir, queue) = open_queue().await;
    let a = queue.create_task(task(TaskType::Research)).await.unwrap();
    queue.create_task(task_after(TaskType::Outline, &a.id)).await.unwrap();
    queue
        .update_task(&a.id, TaskPatch::failed("boom"))
        .await
        .unwrap();
    assert!(queue.get_next_task(None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_priority_order_is_stable() {
    let (_dir, queue) = open_queue().await;
    let mut low = task(TaskType::Research);
    low.priority = Some(Priority::Low);
    let low = queue.create_task(low).await.unwrap();
    let normal_1 = queue.create_task(task(TaskType::Research)).await.unwrap();
    let normal_2 = queue.create_task(task(TaskType::Research)).await.unwrap();
    let mut critical = task(TaskType::Research);
    critical.priority = Some(Priority::Critical);
    let critical = queue.create_task(critical).await.unwrap();

    let mut order = Vec::new();
    while let Some(t) = queue.claim_next_task(None).await.unwrap() {
        order.push(t.id);
    }
    assert_eq!(order, vec![critical.id, normal_1.id, normal_2.id, low.id]);
}

#[tokio::test]
async fn test_next_task_filters_by_role() {
    let (_dir, queue) = open_queue().await;
    let mut research = task(TaskType::Research);
    research.assigned_agent = Some("researcher".into());
    queue.create_task(research).await.unwrap();
    let mut review = task(TaskType::Review);
    review.assigned_agent = Some("reviewer".into());
    let review = queue.create_task(review).await.unwrap();

    let next = queue.get_next_task(Some("reviewer")).await.unwrap().unwrap();
    assert_eq!(next.id, review.id);
    assert!(queue.get_next_task(Some("editor")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_next_does_not_claim() {
    let (_dir, queue) = open_queue().await;
    let t = queue.create_task(task(TaskType::Research)).await.unwrap();
    let a = queue.get_next_task(None).await.unwrap().unwrap();
    let b = queue.get_next_task(None).await.unwrap().unwrap();
    assert_eq!(a.id, t.id);
    assert_eq!(b.id, t.id);
    assert_eq!(b.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_task() {
    let (_dir, queue) = open_queue().await;
    for _ in 0..5 {
        queue.create_task(task(TaskType::Research)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let q = queue.clone();
        handles.push(tokio::spawn(async move { q.claim_next_task(None).await.unwrap() }));
    }
    let mut claimed = Vec::new();
    for h in handles {
        if let Some(t) = h.await.unwrap() {
            assert_eq!(t.status, TaskStatus::InProgress);
            assert!(t.started_at.is_some());
            claimed.push(t.id);
        }
    }
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, 5);
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn test_retry_resets_failed_task() {
    let (_dir, queue) = open_queue().await;
    let t = queue.create_task(task(TaskType::Write)).await.unwrap();
    queue
        .update_task(&t.id, TaskPatch::failed("model error"))
        .await
        .unwrap();

    let retried = queue.retry_task(&t.id).await.unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.error.is_none());
    assert!(retried.completed_at.is_none());
}

#[tokio::test]
async fn test_retry_preconditions_are_silent_noops() {
    let (_dir, queue) = open_queue().await;
    assert!(queue.retry_task("missing").await.unwrap().is_none());

    let t = queue.create_task(task(TaskType::Write)).await.unwrap();
    assert!(queue.retry_task(&t.id).await.unwrap().is_none());
    let pending = queue.get_task(&t.id).await.unwrap().unwrap();
    assert_eq!(pending.retry_count, 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted_never_mutates() {
    let (_dir, queue) = open_queue().await;
    let t = queue.create_task(task(TaskType::Write)).await.unwrap();
    for _ in 0..2 {
        queue.update_task(&t.id, TaskPatch::failed("x")).await.unwrap();
        assert!(queue.retry_task(&t.id).await.unwrap().is_some());
    }
    queue.update_task(&t.id, TaskPatch::failed("final")).await.unwrap();
    let before = queue.get_task(&t.id).await.unwrap().unwrap();
    assert_eq!(before.retry_count, 2);

    assert!(queue.retry_task(&t.id).await.unwrap().is_none());
    let after = queue.get_task(&t.id).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_cleanup_fails_only_old_in_progress_tasks() {
    let (_dir, queue) = open_queue().await;
    let old = queue.create_task(task(TaskType::Research)).await.unwrap();
    let young = queue.create_task(task(TaskType::Research)).await.unwrap();
    let old_pending = queue.create_task(task(TaskType::Research)).await.unwrap();

    let mut list = queue.load().await.unwrap();
    for t in &mut list.tasks {
        if t.id == old.id || t.id == young.id {
            t.status = TaskStatus::InProgress;
        }
        if t.id == old.id || t.id == old_pending.id {
            t.created_at = Utc::now() - Duration::minutes(30);
        }
    }
    queue.save(list).await.unwrap();

    let n = queue.cleanup_stale_tasks(15).await.unwrap();
    assert_eq!(n, 1);

    let old = queue.get_task(&old.id).await.unwrap().unwrap();
    assert_eq!(old.status, TaskStatus::Failed);
    assert!(old.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(old.completed_at.is_some());

    let young = queue.get_task(&young.id).await.unwrap().unwrap();
    assert_eq!(young.status, TaskStatus::InProgress);
    let old_pending = queue.get_task(&old_pending.id).await.unwrap().unwrap();
    assert_eq!(old_pending.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_tasks_by_issue_and_stats() {
    let (_dir, queue) = open_queue().await;
    for (issue, status) in [
        (7, TaskStatus::Pending),
        (7, TaskStatus::Completed),
        (8, TaskStatus::Failed),
        (8, TaskStatus::Cancelled),
        (9, TaskStatus::InProgress),
    ] {
        let mut spec = task(TaskType::Research);
        spec.issue_number = Some(issue);
        let t = queue.create_task(spec).await.unwrap();
        queue.update_task(&t.id, TaskPatch::status(status)).await.unwrap();
    }

    assert_eq!(queue.get_tasks_by_issue(7).await.unwrap().len(), 2);
    assert!(queue.get_tasks_by_issue(99).await.unwrap().is_empty());

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(
        stats.pending + stats.in_progress + stats.completed + stats.failed + stats.cancelled,
        stats.total
    );
    assert_eq!(stats.cancelled, 1);
}

#[tokio::test]
async fn test_save_failure_is_reported_and_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    // Parent "directory" is a regular file, so every save fails.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").unwrap();
    let queue = TaskQueue::open(TaskStore::new(blocker.join("tasks.json"))).await;

    let err = queue.create_task(task(TaskType::Research)).await.unwrap_err();
    assert!(matches!(err, QueueError::Store(_)));
    assert!(queue.load().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn test_save_rejects_cycles_and_unknown_dependencies() {
    let (_dir, queue) = open_queue().await;
    let a = queue.create_task(task(TaskType::Research)).await.unwrap();
    let b = queue.create_task(task_after(TaskType::Outline, &a.id)).await.unwrap();

    let mut cyclic = queue.load().await.unwrap();
    cyclic.tasks[0].depends_on = vec![b.id.clone()];
    let err = queue.save(cyclic).await.unwrap_err();
    assert!(matches!(err, QueueError::DependencyCycle(_)));

    let mut dangling = queue.load().await.unwrap();
    dangling.tasks[1].depends_on.push("ghost".to_string());
    let err = queue.save(dangling).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownDependency(ref id) if id == "ghost"));

    let stored = queue.load().await.unwrap();
    assert!(stored.tasks[0].depends_on.is_empty());
    assert_eq!(stored.tasks[1].depends_on, vec![a.id]);
}
