use quill_core::types::{Task, TaskType};
use serde_json::Value;

use crate::model::ChatMessage;

const SYSTEM_PROMPT: &str = "You are part of an editorial team that produces technical documentation \
for a developer portal. Write in clear, direct Markdown. Do not invent APIs, \
versions or quotes you cannot support from the material you are given.";

/// Stage instruction for a task type.
pub fn stage_instruction(task_type: &TaskType) -> String {
    match task_type {
        TaskType::Research => "Research the requested topic. List the key concepts, the questions \
a reader will have, relevant prior documentation, and any open points that need a maintainer's \
decision. Output a structured research brief."
            .into(),
        TaskType::Outline => "Using the research brief, produce a document outline: title, \
a one-paragraph summary, and a hierarchy of sections with two or three bullet points each."
            .into(),
        TaskType::Write => "Write the full document following the outline exactly. Include code \
samples where they help. Output only the document."
            .into(),
        TaskType::Review => "Review the draft for technical accuracy, gaps, and clarity. Output a \
numbered list of concrete changes, most important first. Do not rewrite the document."
            .into(),
        TaskType::Refine => "Apply the review comments to the draft and output the final \
document in full."
            .into(),
        TaskType::Custom(name) => {
            format!("Perform the '{name}' step for this request and output the result.")
        }
    }
}

/// Text of a finished task: `output.content` when present, otherwise the raw JSON.
pub fn output_text(task: &Task) -> Option<String> {
    let output = task.output.as_ref()?;
    match output.get("content").and_then(Value::as_str) {
        Some(text) => Some(text.to_string()),
        None if output.is_null() => None,
        None => Some(output.to_string()),
    }
}

/// Build the message list for one stage: a shared system prompt, then the
/// request payload, the outputs of the task's dependencies, and the stage
/// instruction.
pub fn build_stage_prompt(task: &Task, dependencies: &[Task]) -> Vec<ChatMessage> {
    let mut s = String::new();

    if let Some(issue) = task.issue_number {
        s.push_str(&format!("Request: issue #{issue}"));
        if let Some(slug) = &task.document_slug {
            s.push_str(&format!(" (document `{slug}`)"));
        }
        s.push_str("\n\n");
    }

    let request = request_fields(&task.input);
    if !request.is_empty() {
        s.push_str("## Request\n\n");
        s.push_str(&request);
        s.push_str("\n\n---\n\n");
    }

    for dep in dependencies {
        if let Some(text) = output_text(dep) {
            s.push_str(&format!("## Output of the {} stage\n\n", dep.task_type));
            s.push_str(text.trim());
            s.push_str("\n\n---\n\n");
        }
    }

    s.push_str(&stage_instruction(&task.task_type));
    if task.retry_count > 0 {
        s.push_str(&format!(
            "\n\nThis is attempt {} of {}; an earlier attempt failed.",
            task.retry_count + 1,
            task.max_retries + 1
        ));
    }

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(s)]
}

/// `key: value` lines for the caller's payload, without pipeline bookkeeping.
fn request_fields(input: &Value) -> String {
    match input {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "pipelineParentId")
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
