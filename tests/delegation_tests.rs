mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{call, complete, fast_options, start, Harness, RecordingTool, ScriptedBackend};
use rankflow::agent::history::HistoryRole;
use rankflow::agent::{Action, Decision};
use rankflow::approval::RiskTier;
use rankflow::error::ReasonCode;
use rankflow::messaging::{Message, MessageKind, SYSTEM_SENDER};
use rankflow::orchestration::DelegationRequest;
use rankflow::org::AgentSpec;
use rankflow::tasks::{SubtaskSpec, Task, TaskInput, TaskStatus, TaskType};
use rankflow::tools::ToolRegistry;

const WAIT: Duration = Duration::from_secs(10);

fn submit(h: &Harness, entry: &str, created_by: &str, objective: &str) -> Task {
    h.runtime
        .request_delegation(DelegationRequest::Submit {
            entry: entry.to_string(),
            created_by: created_by.to_string(),
            task_type: TaskType::Plan,
            input: TaskInput::objective(objective),
        })
        .unwrap()
        .remove(0)
}

fn split(h: &Harness, parent: &Task, subtasks: Vec<SubtaskSpec>) -> Result<Vec<Task>, ReasonCode> {
    h.runtime
        .request_delegation(DelegationRequest::Split {
            parent_id: parent.id.clone(),
            delegator: parent.assignee.clone(),
            subtasks,
        })
        .map_err(|f| f.reason)
}

/// Lead and dev-1 both park on an approval nobody answers, so their tasks
/// stay open for the length of a test.
async fn parked_lead() -> (Harness, Task) {
    let backend = ScriptedBackend::new()
        .script("lead", vec![call("deploy", json!({}))])
        .script("dev-1", vec![call("deploy", json!({}))]);
    let mut options = fast_options();
    options.approval_timeout = Duration::from_secs(60);
    let h = start(
        backend,
        ToolRegistry::new().with(Arc::new(RecordingTool::new("deploy", RiskTier::High))),
        options,
    );
    let mut approvals = h.runtime.subscribe_approvals();
    let parent = submit(&h, "lead", "ceo", "ship the release");

    loop {
        let request = tokio::time::timeout(WAIT, approvals.recv())
            .await
            .expect("lead files an approval request")
            .unwrap();
        if request.actor == "lead" {
            break;
        }
    }
    assert_eq!(h.runtime.task(&parent.id).unwrap().status, TaskStatus::InProgress);
    (h, parent)
}

// ============================================================
// End-to-end split with a sibling dependency
// ============================================================

#[tokio::test]
async fn test_split_children_run_in_dependency_order_and_complete_parent() {
    let delegate = Decision::new(
        "split the work",
        Action::Delegate {
            subtasks: vec![
                SubtaskSpec::new("dev-1", "build the parser"),
                SubtaskSpec::new("dev-2", "test the parser").after(0),
            ],
        },
    );
    let backend = ScriptedBackend::new()
        .script("lead", vec![delegate, complete("integrated")])
        .script("dev-1", vec![complete("built")])
        .script("dev-2", vec![complete("tested")]);
    let h = start(backend, ToolRegistry::new(), fast_options());

    let root = submit(&h, "lead", "ceo", "ship a parser");
    let done = h.runtime.wait_for_task(&root.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.children.len(), 2);

    let build = h.runtime.task(&done.children[0]).unwrap();
    let test = h.runtime.task(&done.children[1]).unwrap();
    assert_eq!(build.assignee, "dev-1");
    assert_eq!(test.assignee, "dev-2");
    assert_eq!(build.status, TaskStatus::Completed);
    assert_eq!(test.status, TaskStatus::Completed);
    assert!(test.dependencies.contains(&build.id));
    assert_eq!(test.parent_id.as_deref(), Some(root.id.as_str()));
    assert!(test.started_at.unwrap() >= build.completed_at.unwrap());
    assert_eq!(test.output.as_ref().unwrap().summary, "tested");

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_chain_nests_one_task_per_level() {
    let backend = ScriptedBackend::new().script("dev-1", vec![complete("done at the bottom")]);
    let h = start(backend, ToolRegistry::new(), fast_options());

    let root = submit(&h, "ceo", SYSTEM_SENDER, "audit dependencies");
    let chain = h
        .runtime
        .request_delegation(DelegationRequest::Chain {
            task_id: root.id.clone(),
            chain: vec!["lead".into(), "dev-1".into()],
        })
        .unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].assignee, "lead");
    assert_eq!(chain[0].parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(chain[0].status, TaskStatus::Reviewing);
    assert_eq!(chain[1].assignee, "dev-1");
    assert_eq!(chain[1].parent_id.as_deref(), Some(chain[0].id.as_str()));
    assert_eq!(chain[1].task_type, TaskType::Execute);

    let done = h.runtime.wait_for_task(&root.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(h.runtime.task(&chain[0].id).unwrap().status, TaskStatus::Completed);
    // The intermediate holder never had to reason about it.
    assert_eq!(h.backend.calls("lead"), 0);

    let err = h
        .runtime
        .request_delegation(DelegationRequest::Chain {
            task_id: submit(&h, "ceo", SYSTEM_SENDER, "again").id,
            chain: vec!["dev-1".into()],
        })
        .unwrap_err();
    assert_eq!(err.reason, ReasonCode::NotSubordinate);

    h.runtime.shutdown().await;
}

// ============================================================
// Refusals
// ============================================================

#[tokio::test]
async fn test_sixth_open_task_is_refused() {
    let (h, parent) = parked_lead().await;

    let five: Vec<SubtaskSpec> = (0..5)
        .map(|i| SubtaskSpec::new("dev-1", &format!("module {i}")))
        .collect();
    split(&h, &parent, five).unwrap();
    assert_eq!(h.runtime.store().open_task_count("dev-1").unwrap(), 5);

    let refused = split(&h, &parent, vec![SubtaskSpec::new("dev-1", "module 5")]);
    assert_eq!(refused.unwrap_err(), ReasonCode::CapacityExceeded);
    assert_eq!(h.runtime.store().open_task_count("dev-1").unwrap(), 5);

    // The limit is per agent.
    split(&h, &parent, vec![SubtaskSpec::new("dev-2", "docs")]).unwrap();

    h.runtime.cancel_task(&parent.id, "ceo").unwrap();
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_delegation_outside_direct_reports_is_refused() {
    let (h, parent) = parked_lead().await;

    for assignee in ["ceo", "partner-lead", "lead"] {
        let refused = split(&h, &parent, vec![SubtaskSpec::new(assignee, "help")]);
        assert_eq!(refused.unwrap_err(), ReasonCode::NotSubordinate, "{assignee}");
    }
    let err = h
        .runtime
        .request_delegation(DelegationRequest::Split {
            parent_id: parent.id.clone(),
            delegator: "dev-1".into(),
            subtasks: vec![SubtaskSpec::new("dev-2", "help")],
        })
        .unwrap_err();
    assert_eq!(err.reason, ReasonCode::NotAuthorized);
    assert!(h.runtime.task(&parent.id).unwrap().children.is_empty());

    h.runtime.cancel_task(&parent.id, "ceo").unwrap();
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_refusal_is_an_observation_for_the_delegator() {
    let outside = Decision::new(
        "fan out",
        Action::Delegate {
            subtasks: vec![SubtaskSpec::new("partner-lead", "cross-team work")],
        },
    );
    let backend = ScriptedBackend::new().script("lead", vec![outside, complete("did it myself")]);
    let h = start(backend, ToolRegistry::new(), fast_options());

    let root = submit(&h, "lead", "ceo", "coordinate");
    let done = h.runtime.wait_for_task(&root.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.children.is_empty());

    let requests = h.backend.requests_from("lead");
    assert!(requests[1]
        .history
        .iter()
        .any(|e| e.role == HistoryRole::Observation && e.content.contains("not_subordinate")));

    h.runtime.shutdown().await;
}

// ============================================================
// Cancellation and staffing
// ============================================================

#[tokio::test]
async fn test_cancel_cascades_to_running_descendants() {
    let (h, parent) = parked_lead().await;
    let children = split(
        &h,
        &parent,
        vec![
            SubtaskSpec::new("dev-1", "first"),
            SubtaskSpec::new("dev-2", "second").after(0),
        ],
    )
    .unwrap();

    let err = h.runtime.cancel_task(&parent.id, "dev-2").unwrap_err();
    assert_eq!(err.reason, ReasonCode::NotAuthorized);

    let cancelled = h.runtime.cancel_task(&parent.id, "ceo").unwrap();
    assert_eq!(cancelled.len(), 3);
    for id in [&parent.id, &children[0].id, &children[1].id] {
        let task = h.runtime.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.failure_reason, Some(ReasonCode::Cancelled));
    }

    let err = h.runtime.cancel_task(&parent.id, "ceo").unwrap_err();
    assert_eq!(err.reason, ReasonCode::AlreadyTerminal);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_busy_agent_cannot_be_archived() {
    let (h, parent) = parked_lead().await;
    let children = split(
        &h,
        &parent,
        vec![
            SubtaskSpec::new("dev-1", "work"),
            SubtaskSpec::new("dev-1", "follow-up").after(0),
        ],
    )
    .unwrap();

    let err = h.runtime.archive_agent("dev-1").unwrap_err();
    assert_eq!(err.reason, ReasonCode::AgentBusy);

    // Blocked work can move to a new hire.
    h.runtime.hire_agent(AgentSpec::new("dev-3", 2, "eng", Some("lead"))).unwrap();
    let moved = h.runtime.reassign_task(&children[1].id, "lead", "dev-3").unwrap();
    assert_eq!(moved.assignee, "dev-3");
    assert_eq!(moved.status, TaskStatus::Blocked);
    let err = h.runtime.reassign_task(&children[1].id, "lead", "partner-lead").unwrap_err();
    assert_eq!(err.reason, ReasonCode::NotSubordinate);

    // An agent with nothing open can go, and stops receiving mail.
    h.runtime.archive_agent("dev-2").unwrap();
    let err = h
        .runtime
        .send_message(Message::direct("lead", "dev-2", MessageKind::Direct, "still there?"))
        .unwrap_err();
    assert_eq!(err.reason, ReasonCode::UnknownAgent);

    h.runtime.cancel_task(&parent.id, "ceo").unwrap();
    h.runtime.shutdown().await;
}
