//! System prompt for an agent activation.
//!
//! Wraps the agent's position in the organisation (rank, department,
//! superior, subordinates) with the tool listing, the action schema the
//! backend must answer in, and the runtime constraints.

use crate::org::AgentRecord;
use crate::tools::ToolSpec;

/// JSON shapes accepted as a decision.
pub const ACTION_SCHEMA: &str = r#"Respond with exactly one JSON object and nothing else:

{"thought": "<your reasoning>", "action": <action>}

where <action> is one of:
- {"type": "tool_call", "tool": "<name>", "args": {...}}
- {"type": "send_message", "to": "<agent id>", "content": "...", "response_required": false}
- {"type": "memory_query", "query": "...", "limit": 5}
- {"type": "delegate", "subtasks": [{"assignee": "<subordinate id>", "objective": "...", "acceptance_criteria": [], "depends_on": [<sibling index>]}]}
- {"type": "resolve_approval", "request_id": "<id>", "approve": true}
- {"type": "complete", "summary": "...", "decisions": [], "deliverables": []}"#;

fn rank_role(rank: u8) -> &'static str {
    match rank {
        0 => "operator",
        1 => "coordinator: you plan work and delegate it down your reporting line",
        _ => "executor: you carry out tasks with tools and report back",
    }
}

/// Build the system prompt for `agent`.
pub fn build_system_prompt(
    agent: &AgentRecord,
    model: &str,
    tools: &[ToolSpec],
    max_rounds: u32,
    max_open_tasks: usize,
) -> String {
    let role = rank_role(agent.rank);
    let superior = agent.reports_to.as_deref().unwrap_or("none");
    let subordinates = if agent.subordinates.is_empty() {
        "none".to_string()
    } else {
        agent
            .subordinates
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };
    let tool_descriptions = if tools.is_empty() {
        "No tools are available.".to_string()
    } else {
        tools
            .iter()
            .map(ToolSpec::describe)
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "\
You are {name} (id `{id}`), an autonomous agent in a ranked organisation.

## Position
- Rank: {rank} ({role})
- Department: {department}
- Reports to: {superior}
- Direct subordinates: {subordinates}
- Model: {model}

## Available Tools
{tool_descriptions}

## Actions
{ACTION_SCHEMA}

## Constraints
- You have at most {max_rounds} rounds per activation
- Repeating the same action three times, or failing three times in a row, ends the activation as stuck
- Medium, high and network risk tools wait for your approver's decision
- Files another task holds a lock on cannot be modified; escalate instead of retrying
- You may only delegate to your direct subordinates; each executor holds at most {max_open_tasks} open tasks
- Choose `complete` as soon as the objective is met",
        name = agent.name,
        id = agent.id,
        rank = agent.rank,
        department = if agent.department.is_empty() { "none" } else { &agent.department },
    )
}
