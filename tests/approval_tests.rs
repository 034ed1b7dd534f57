mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{call, complete, fast_options, start, RecordingTool, ScriptedBackend};
use rankflow::agent::history::HistoryRole;
use rankflow::agent::{Action, Decision, DecisionRequest};
use rankflow::approval::{ApprovalRequest, Resolution, RiskTier};
use rankflow::error::ReasonCode;
use rankflow::orchestration::DelegationRequest;
use rankflow::tasks::{Task, TaskInput, TaskStatus, TaskType};
use rankflow::tools::ToolRegistry;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn submit(runtime: &rankflow::orchestration::Runtime, entry: &str, created_by: &str) -> Task {
    runtime
        .request_delegation(DelegationRequest::Submit {
            entry: entry.to_string(),
            created_by: created_by.to_string(),
            task_type: TaskType::Execute,
            input: TaskInput::objective("deploy the build"),
        })
        .unwrap()
        .remove(0)
}

async fn next_request(rx: &mut broadcast::Receiver<ApprovalRequest>) -> ApprovalRequest {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("approval request filed in time")
        .expect("approval channel open")
}

fn saw_observation(request: &DecisionRequest, needle: &str) -> bool {
    request
        .history
        .iter()
        .any(|e| e.role == HistoryRole::Observation && e.content.contains(needle))
}

// ============================================================
// Rank-2 high-risk action approved by its superior
// ============================================================

#[tokio::test]
async fn test_superior_approval_lets_action_proceed() {
    let deploy = RecordingTool::new("deploy", RiskTier::High);
    let calls = deploy.calls();
    let backend = ScriptedBackend::new()
        .script("dev-1", vec![call("deploy", json!({"target": "prod"})), complete("deployed")])
        .script("lead", vec![complete("reviewed")]);
    let h = start(backend, ToolRegistry::new().with(Arc::new(deploy)), fast_options());
    let mut approvals = h.runtime.subscribe_approvals();

    let task = submit(&h.runtime, "dev-1", "lead");
    let request = next_request(&mut approvals).await;
    assert_eq!(request.actor, "dev-1");
    assert_eq!(request.approver, "lead");
    assert_eq!(request.risk, RiskTier::High);
    assert_eq!(request.action.task_id.as_deref(), Some(task.id.as_str()));
    assert!(calls.lock().unwrap().is_empty(), "tool must wait for approval");

    let resolution = h.runtime.resolve_approval(&request.id, "lead", true).unwrap();
    assert_eq!(resolution, Resolution::Approved);

    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(h.runtime.gate().get(&request.id).unwrap().resolution, Resolution::Approved);

    // Resolving again changes nothing and reports the original outcome.
    let again = h.runtime.resolve_approval(&request.id, "lead", false).unwrap();
    assert_eq!(again, Resolution::Approved);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_denial_becomes_failed_observation() {
    let deploy = RecordingTool::new("deploy", RiskTier::High);
    let calls = deploy.calls();
    let backend = ScriptedBackend::new()
        .script("dev-1", vec![call("deploy", json!({})), complete("replanned")])
        .script("lead", vec![complete("reviewed")]);
    let h = start(backend, ToolRegistry::new().with(Arc::new(deploy)), fast_options());
    let mut approvals = h.runtime.subscribe_approvals();

    let task = submit(&h.runtime, "dev-1", "lead");
    let request = next_request(&mut approvals).await;
    h.runtime.resolve_approval(&request.id, "lead", false).unwrap();

    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(calls.lock().unwrap().is_empty());

    let requests = h.backend.requests_from("dev-1");
    assert_eq!(requests.len(), 2);
    assert!(saw_observation(&requests[1], "approval_denied"));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out_distinctly() {
    let deploy = RecordingTool::new("deploy", RiskTier::Medium);
    let calls = deploy.calls();
    let backend = ScriptedBackend::new()
        .script("dev-1", vec![call("deploy", json!({})), complete("gave up")])
        .script("lead", vec![complete("busy")]);
    let mut options = fast_options();
    options.approval_timeout = Duration::from_millis(200);
    let h = start(backend, ToolRegistry::new().with(Arc::new(deploy)), options);
    let mut approvals = h.runtime.subscribe_approvals();

    let task = submit(&h.runtime, "dev-1", "lead");
    let request = next_request(&mut approvals).await;

    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(h.runtime.gate().get(&request.id).unwrap().resolution, Resolution::TimedOut);

    let requests = h.backend.requests_from("dev-1");
    assert!(saw_observation(&requests[1], "approval_timeout"));
    assert!(!saw_observation(&requests[1], "approval_denied"));

    h.runtime.shutdown().await;
}

// ============================================================
// Agent approvers answer through their own loop
// ============================================================

/// Approve the first pending request in the activation's task statement,
/// then finish once the gate confirms it.
fn approve_pending(request: &DecisionRequest) -> Decision {
    let pending = request.history.iter().find_map(|e| {
        let rest = e.content.split("Pending approval ").nth(1)?;
        rest.split_whitespace().next().map(str::to_string)
    });
    match pending {
        Some(id) if !saw_observation(request, &format!("approval request {id} is")) => Decision::new(
            "approve the subordinate",
            Action::ResolveApproval {
                request_id: id,
                approve: true,
            },
        ),
        _ => complete("approvals handled"),
    }
}

#[tokio::test]
async fn test_lead_resolves_subordinate_request_from_inbox() {
    let deploy = RecordingTool::new("deploy", RiskTier::High);
    let calls = deploy.calls();
    let backend = ScriptedBackend::new()
        .script("dev-1", vec![call("deploy", json!({})), complete("deployed")])
        .respond("lead", approve_pending);
    let h = start(backend, ToolRegistry::new().with(Arc::new(deploy)), fast_options());

    let task = submit(&h.runtime, "dev-1", "lead");
    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(h.backend.calls("lead") >= 1);

    h.runtime.shutdown().await;
}

// ============================================================
// Rank-1 actions always escalate to the operator
// ============================================================

#[tokio::test]
async fn test_rank_one_request_goes_to_operator() {
    let deploy = RecordingTool::new("deploy", RiskTier::Medium);
    let backend = ScriptedBackend::new().script("lead", vec![call("deploy", json!({})), complete("done")]);
    let h = start(backend, ToolRegistry::new().with(Arc::new(deploy)), fast_options());
    let mut approvals = h.runtime.subscribe_approvals();

    let task = submit(&h.runtime, "lead", "ceo");
    let request = next_request(&mut approvals).await;
    assert_eq!(request.approver, "ceo");
    assert_eq!(h.runtime.pending_approvals("ceo").unwrap().len(), 1);

    let err = h.runtime.resolve_approval(&request.id, "dev-1", true).unwrap_err();
    assert_eq!(err.reason, ReasonCode::NotAuthorized);

    h.runtime.resolve_approval(&request.id, "ceo", true).unwrap();
    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_network_outside_allow_list_is_refused_without_request() {
    let fetch = RecordingTool::new("fetch", RiskTier::Network);
    let calls = fetch.calls();
    let backend = ScriptedBackend::new().script(
        "dev-1",
        vec![call("fetch", json!({"url": "https://evil.example/"})), complete("skipped")],
    );
    let h = start(backend, ToolRegistry::new().with(Arc::new(fetch)), fast_options());

    let task = submit(&h.runtime, "dev-1", "lead");
    let done = h.runtime.wait_for_task(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(calls.lock().unwrap().is_empty());
    assert!(h.runtime.pending_approvals("lead").unwrap().is_empty());

    let requests = h.backend.requests_from("dev-1");
    assert!(saw_observation(&requests[1], "network_not_allowed"));

    h.runtime.shutdown().await;
}
