use serde_json::{Map, Value};
use tracing::{error, info};

use crate::{
    queue::{QueueError, TaskQueue},
    types::{NewTask, Task, TaskType},
};

/// One stage of the document pipeline and the role that works it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub task_type: TaskType,
    pub agent: &'static str,
}

/// research -> outline -> write -> review -> refine, strictly linear.
pub fn document_stages() -> Vec<Stage> {
    vec![
        Stage { task_type: TaskType::Research, agent: "researcher" },
        Stage { task_type: TaskType::Outline, agent: "writer" },
        Stage { task_type: TaskType::Write, agent: "writer" },
        Stage { task_type: TaskType::Review, agent: "reviewer" },
        Stage { task_type: TaskType::Refine, agent: "editor" },
    ]
}

/// Stage input: the caller's payload plus `pipelineParentId`. Non-object
/// payloads are kept under `request`.
fn stage_input(input: &Value, parent_id: &str) -> Value {
    let mut obj = match input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("request".into(), other.clone());
            m
        }
    };
    obj.insert("pipelineParentId".into(), Value::String(parent_id.to_string()));
    Value::Object(obj)
}

/// Expand one Issue into the five-stage document pipeline.
///
/// Stages are created one after another, each depending on the one before.
/// If a later creation fails the earlier stages stay behind as pending work;
/// the error is returned so the caller can report it.
pub async fn create_pipeline_tasks(
    queue: &TaskQueue,
    issue_number: u64,
    input: Value,
) -> Result<Vec<Task>, QueueError> {
    let parent_id = uuid::Uuid::new_v4().to_string();
    let input = stage_input(&input, &parent_id);
    let slug = input
        .get("documentSlug")
        .or_else(|| input.get("slug"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut created: Vec<Task> = Vec::with_capacity(5);
    for stage in document_stages() {
        let mut spec = NewTask::new(stage.task_type.clone());
        spec.issue_number = Some(issue_number);
        spec.document_slug = slug.clone();
        spec.parent_task_id = Some(parent_id.clone());
        spec.depends_on = created.last().map(|t| vec![t.id.clone()]).unwrap_or_default();
        spec.input = input.clone();
        spec.assigned_agent = Some(stage.agent.to_string());

        match queue.create_task(spec).await {
            Ok(task) => created.push(task),
            Err(e) => {
                error!(
                    issue = issue_number,
                    stage = %stage.task_type,
                    created = created.len(),
                    "pipeline creation stopped part-way: {e}"
                );
                return Err(e);
            }
        }
    }

    info!(
        issue = issue_number,
        parent_task_id = %parent_id,
        "created {}-stage document pipeline",
        created.len()
    );
    Ok(created)
}
