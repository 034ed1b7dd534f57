use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use rankflow::agent::journal::Journal;
use rankflow::agent::{check_backend_ready, GenaiBackend};
use rankflow::approval::{ApprovalGate, ApprovalRequest};
use rankflow::cli::{Cli, Commands};
use rankflow::config::{self, AppConfig};
use rankflow::messaging::SYSTEM_SENDER;
use rankflow::orchestration::{DelegationRequest, Runtime};
use rankflow::org::loader::load_org_file;
use rankflow::org::Organization;
use rankflow::store::{MemoryStore, Store};
use rankflow::tasks::{TaskInput, TaskType};
use rankflow::tools::builtin::builtin_registry;
use rankflow::tools::workspace::WorkspaceGuard;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("rankflow starting");

    let config = config::load_config(&cli)?;
    tracing::info!(model = %config.model, workspace = %config.workspace.display(), "Config loaded");

    match cli.command {
        Commands::Run {
            org,
            entry,
            objective,
            criteria,
            auto_approve,
            ..
        } => {
            let input = TaskInput {
                acceptance_criteria: criteria,
                ..TaskInput::objective(objective)
            };
            run(&config, &org, &entry, input, auto_approve).await
        }
        Commands::Org { org } => print_org(&org),
    }
}

async fn run(
    config: &AppConfig,
    org_path: &Path,
    entry: &str,
    input: TaskInput,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let org = Arc::new(load_org_file(org_path)?);

    check_backend_ready(&config.model).await?;
    let backend = Arc::new(GenaiBackend::new(&config.model));

    let guard = WorkspaceGuard::new(&config.workspace)?;
    let tools = builtin_registry(guard, config.shell_timeout());

    let journal = match &config.journal_path {
        Some(path) => Journal::at(path)?,
        None => Journal::for_workspace(&config.workspace)?,
    };
    if let Some(path) = journal.path() {
        tracing::info!(path = %path.display(), "Journal opened");
    }

    let options = config.runtime_options(journal)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let runtime = Arc::new(Runtime::start(org.clone(), store, tools, backend, options));

    let console = tokio::spawn(approval_console(runtime.clone(), auto_approve));

    // Work submitted from the command line is owned by the entry agent's operator.
    let created_by = org
        .root_of(entry)
        .filter(|root| org.rank_of(root) == Some(0) && root != entry)
        .unwrap_or_else(|| SYSTEM_SENDER.to_string());
    let submitted = runtime.request_delegation(DelegationRequest::Submit {
        entry: entry.to_string(),
        created_by,
        task_type: TaskType::Plan,
        input,
    })?;
    let Some(root) = submitted.into_iter().next() else {
        anyhow::bail!("Submission produced no task");
    };
    println!("Submitted task {} to {}", root.id, entry);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let task = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Interrupted; shutting down.");
                break runtime.task(&root.id)?;
            }
            task = runtime.wait_for_task(&root.id, Duration::from_secs(1)) => {
                let task = task?;
                if task.status.is_terminal() {
                    break task;
                }
            }
        }
    };

    let report = serde_json::json!({
        "task": task,
        "loops": runtime.loops(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    console.abort();
    runtime.shutdown().await;
    Ok(())
}

/// Service approval requests addressed to rank-0 operators.
async fn approval_console(runtime: Arc<Runtime>, auto_approve: bool) {
    let mut requests = runtime.subscribe_approvals();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let request = match requests.recv().await {
            Ok(request) => request,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Approval console lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if !runtime.org().get(&request.approver).is_some_and(|r| r.is_operator()) {
            continue;
        }

        let approve = if auto_approve {
            true
        } else {
            println!("{}", describe(&request));
            println!("Approve? [y/N]");
            match lines.next_line().await {
                Ok(Some(line)) => matches!(line.trim(), "y" | "Y" | "yes"),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read approval answer");
                    false
                }
            }
        };

        match runtime.resolve_approval(&request.id, &request.approver, approve) {
            Ok(resolution) => println!("Request {} {}", request.id, resolution),
            Err(failure) => println!("Request {} not resolved: {}", request.id, failure),
        }
    }
}

fn describe(request: &ApprovalRequest) -> String {
    let mut text = format!(
        "[{}] {} wants to: {}",
        request.risk, request.actor, request.action.description
    );
    if let Some(resource) = &request.action.resource {
        text.push_str(&format!(" ({resource})"));
    }
    text
}

fn print_org(path: &Path) -> anyhow::Result<()> {
    let org = Arc::new(load_org_file(path)?);
    let gate = ApprovalGate::new(
        org.clone(),
        Arc::new(MemoryStore::new()),
        Default::default(),
        Duration::from_secs(600),
        Journal::disabled(),
    );
    for root in org.roots() {
        print_subtree(&org, &gate, &root, 0)?;
    }
    Ok(())
}

fn print_subtree(
    org: &Organization,
    gate: &ApprovalGate,
    id: &str,
    depth: usize,
) -> anyhow::Result<()> {
    let Some(record) = org.get(id) else {
        return Ok(());
    };
    let approver = gate
        .approver_for(id)?
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}{} (rank {}, {}) approver: {}",
        "  ".repeat(depth),
        record.id,
        record.rank,
        record.department,
        approver
    );
    for child in org.direct_subordinates(id) {
        print_subtree(org, gate, &child, depth + 1)?;
    }
    Ok(())
}
