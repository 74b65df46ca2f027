use quill_core::{
    pipeline::{create_pipeline_tasks, document_stages},
    queue::TaskQueue,
    store::TaskStore,
    TaskPatch, TaskStatus, TaskType,
};
use serde_json::json;

async fn open_queue() -> (tempfile::TempDir, TaskQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = TaskQueue::open(TaskStore::new(dir.path().join("tasks.json"))).await;
    (dir, queue)
}

#[test]
fn test_stage_roles() {
    let stages: Vec<(TaskType, &str)> = document_stages()
        .into_iter()
        .map(|s| (s.task_type, s.agent))
        .collect();
    assert_eq!(
        stages,
        vec![
            (TaskType::Research, "researcher"),
            (TaskType::Outline, "writer"),
            (TaskType::Write, "writer"),
            (TaskType::Review, "reviewer"),
            (TaskType::Refine, "editor"),
        ]
    );
}

#[tokio::test]
async fn test_pipeline_is_a_linear_chain() {
    let (_dir, queue) = open_queue().await;
    let tasks = create_pipeline_tasks(&queue, 42, json!({"topic": "x"}))
        .await
        .unwrap();

    assert_eq!(tasks.len(), 5);
    let parent = tasks[0].parent_task_id.clone().unwrap();
    assert!(tasks.iter().all(|t| t.parent_task_id.as_deref() == Some(parent.as_str())));
    assert!(tasks.iter().all(|t| t.issue_number == Some(42)));
    assert!(tasks[0].depends_on.is_empty());
    for pair in tasks.windows(2) {
        assert_eq!(pair[1].depends_on, vec![pair[0].id.clone()]);
    }
}

#[tokio::test]
async fn test_pipeline_input_is_shared_with_parent_id() {
    let (_dir, queue) = open_queue().await;
    let tasks = create_pipeline_tasks(&queue, 3, json!({"topic": "x", "documentSlug": "intro"}))
        .await
        .unwrap();
    let parent = tasks[0].parent_task_id.clone().unwrap();
    for t in &tasks {
        assert_eq!(t.input["topic"], json!("x"));
        assert_eq!(t.input["pipelineParentId"], json!(parent));
        assert_eq!(t.document_slug.as_deref(), Some("intro"));
    }
}

#[tokio::test]
async fn test_non_object_input_is_wrapped() {
    let (_dir, queue) = open_queue().await;
    let tasks = create_pipeline_tasks(&queue, 1, json!("write about queues"))
        .await
        .unwrap();
    assert_eq!(tasks[0].input["request"], json!("write about queues"));
    assert!(tasks[0].input["pipelineParentId"].is_string());
}

#[tokio::test]
async fn test_pipeline_advances_one_stage_at_a_time() {
    let (_dir, queue) = open_queue().await;
    let tasks = create_pipeline_tasks(&queue, 5, json!({})).await.unwrap();

    for expected in &tasks {
        let claimed = queue.claim_next_task(None).await.unwrap().unwrap();
        assert_eq!(claimed.id, expected.id);
        assert!(queue.claim_next_task(None).await.unwrap().is_none());
        queue
            .update_task(&claimed.id, TaskPatch::completed(json!({"content": "ok"})))
            .await
            .unwrap();
    }
    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 5);
    assert!(queue
        .load()
        .await
        .unwrap()
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed));
}
