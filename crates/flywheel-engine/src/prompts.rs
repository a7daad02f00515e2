use serde::Deserialize;
use serde_json::Value;

use flywheel_store::jobs::JobRow;
use flywheel_store::tasks::{NewTask, TaskRow, TaskStatus};

/// Prompt for the one-time setup session: prepare the working branch and
/// record the request document in the repository.
pub fn setup_prompt(job: &JobRow) -> String {
    format!(
        "You are setting up an autonomous improvement run for {owner}/{repo}.\n\
         Create the working branch `{working}` from `{base}` and store the \
         specification below at the repository root so later sessions can read it.\n\n\
         Specification:\n{doc}",
        owner = job.repo_owner,
        repo = job.repo_name,
        working = job.working_branch,
        base = job.base_branch,
        doc = job.request_doc,
    )
}

/// Prompt for the discovery session: analyze the repository and decide on
/// the next batch of parallelizable tasks.
pub fn discovery_prompt(job: &JobRow) -> String {
    format!(
        "Analyze the repository {owner}/{repo} on branch `{working}` and decide on up to \
         {limit} independent tasks that move the following goal forward and can run in \
         parallel without conflicting edits.\n\n\
         Goal:\n{doc}\n\n\
         Current task list:\n{list}\n\n\
         Respond with a JSON array of objects with fields `description`, `context` \
         (optional), `priority` (integer, optional) and `canRunParallel` (boolean, \
         optional). Respond with an empty array when no further work is needed.",
        owner = job.repo_owner,
        repo = job.repo_name,
        working = job.working_branch,
        limit = job.max_parallel_tasks,
        doc = job.request_doc,
        list = if job.task_list.is_empty() { "(none yet)" } else { &job.task_list },
    )
}

/// Prompt for one execution session.
pub fn task_prompt(job: &JobRow, task: &TaskRow) -> String {
    let mut prompt = format!(
        "Execute this task on branch `{working}` of {owner}/{repo}, then commit and push \
         your changes.\n\nTask: {description}",
        working = job.working_branch,
        owner = job.repo_owner,
        repo = job.repo_name,
        description = task.description,
    );
    if let Some(context) = &task.context {
        prompt.push_str("\n\nContext: ");
        prompt.push_str(context);
    }
    prompt
}

/// Prompt for the update session: fold the cycle's outcomes into a revised
/// task list.
pub fn update_prompt(job: &JobRow, cycle_number: u32, tasks: &[TaskRow]) -> String {
    let mut outcomes = String::new();
    for task in tasks {
        let line = match task.status {
            TaskStatus::Completed => format!(
                "- [done] {}: {}\n",
                task.description,
                task.result_summary.as_deref().unwrap_or("completed")
            ),
            TaskStatus::Failed => format!(
                "- [failed] {}: {}\n",
                task.description,
                task.error_message.as_deref().unwrap_or("failed")
            ),
            _ => format!("- [pending] {}\n", task.description),
        };
        outcomes.push_str(&line);
    }

    format!(
        "Cycle {cycle_number} of the improvement run for {owner}/{repo} has finished with \
         these outcomes:\n{outcomes}\n\
         Produce an updated task list for the overall goal, marking finished work and \
         carrying forward anything that failed or remains.\n\nGoal:\n{doc}",
        owner = job.repo_owner,
        repo = job.repo_name,
        doc = job.request_doc,
    )
}

#[derive(Debug, Deserialize)]
struct DiscoveredTask {
    description: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_parallel", alias = "canRunParallel")]
    can_run_parallel: bool,
}

fn default_parallel() -> bool {
    true
}

/// Parse a discovery session's result into task parameters. Tolerates a
/// fenced code block and either a bare array or `{"tasks": [...]}`. Anything
/// unparseable yields an empty list — indistinguishable from "no further
/// work", matching how the loop treats a failed discovery.
pub fn parse_discovered_tasks(raw: &str) -> Vec<NewTask> {
    let stripped = strip_code_fence(raw);

    let value: Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<DiscoveredTask>(item).ok())
        .filter(|t| !t.description.trim().is_empty())
        .map(|t| NewTask {
            description: t.description,
            context: t.context,
            priority: t.priority,
            can_run_parallel: t.can_run_parallel,
        })
        .collect()
}

/// Strip a surrounding markdown code fence, if any.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => return trimmed,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}
