use serde::Deserialize;
use std::path::PathBuf;

/// The TOML file structure for rankflow.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub limits: Option<LimitsConfig>,
    pub approval: Option<ApprovalConfig>,
    pub locks: Option<LocksConfig>,
    pub messaging: Option<MessagingConfig>,
    pub tools: Option<ToolsConfig>,
    pub journal: Option<JournalConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub model: Option<String>,
    pub workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    pub reasoning_iterations: Option<u32>,
    pub context_budget_tokens: Option<usize>,
    pub max_open_tasks: Option<usize>,
    pub activation_timeout_secs: Option<u64>,
    pub stall_threshold_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalConfig {
    pub timeout_secs: Option<u64>,
    /// Regex patterns. If specified, fully replaces lower layers.
    pub network_allow_list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct LocksConfig {
    pub ttl_secs: Option<u64>,
    pub reap_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingConfig {
    pub default_ttl_secs: Option<u64>,
    pub relay_backoff_ms: Option<u64>,
    pub relay_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsConfig {
    pub shell_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct JournalConfig {
    pub path: Option<String>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub model: String,
    pub workspace: PathBuf,
    pub reasoning_iterations: u32,
    pub context_budget_tokens: usize,
    pub max_open_tasks: usize,
    pub activation_timeout_secs: u64,
    pub stall_threshold_secs: u64,
    pub approval_timeout_secs: u64,
    pub network_allow_list: Vec<String>,
    pub lock_ttl_secs: u64,
    pub lock_reap_interval_ms: u64,
    pub default_ttl_secs: u64,
    pub relay_backoff_ms: u64,
    pub relay_backoff_max_ms: u64,
    pub shell_timeout_secs: u64,
    /// `None` writes the journal next to the workspace.
    pub journal_path: Option<PathBuf>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub model: Option<String>,
    pub workspace: Option<PathBuf>,
    pub reasoning_iterations: Option<u32>,
    pub context_budget_tokens: Option<usize>,
    pub max_open_tasks: Option<usize>,
    pub activation_timeout_secs: Option<u64>,
    pub stall_threshold_secs: Option<u64>,
    pub approval_timeout_secs: Option<u64>,
    pub network_allow_list: Option<Vec<String>>,
    pub lock_ttl_secs: Option<u64>,
    pub lock_reap_interval_ms: Option<u64>,
    pub default_ttl_secs: Option<u64>,
    pub relay_backoff_ms: Option<u64>,
    pub relay_backoff_max_ms: Option<u64>,
    pub shell_timeout_secs: Option<u64>,
    pub journal_path: Option<PathBuf>,
}

impl ConfigFile {
    /// Flatten the sectioned file into a mergeable layer.
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general;
        let limits = self.limits;
        let approval = self.approval;
        let locks = self.locks;
        let messaging = self.messaging;
        PartialConfig {
            model: general.as_ref().and_then(|g| g.model.clone()),
            workspace: general.and_then(|g| g.workspace).map(PathBuf::from),
            reasoning_iterations: limits.as_ref().and_then(|l| l.reasoning_iterations),
            context_budget_tokens: limits.as_ref().and_then(|l| l.context_budget_tokens),
            max_open_tasks: limits.as_ref().and_then(|l| l.max_open_tasks),
            activation_timeout_secs: limits.as_ref().and_then(|l| l.activation_timeout_secs),
            stall_threshold_secs: limits.and_then(|l| l.stall_threshold_secs),
            approval_timeout_secs: approval.as_ref().and_then(|a| a.timeout_secs),
            network_allow_list: approval.and_then(|a| a.network_allow_list),
            lock_ttl_secs: locks.as_ref().and_then(|l| l.ttl_secs),
            lock_reap_interval_ms: locks.and_then(|l| l.reap_interval_ms),
            default_ttl_secs: messaging.as_ref().and_then(|m| m.default_ttl_secs),
            relay_backoff_ms: messaging.as_ref().and_then(|m| m.relay_backoff_ms),
            relay_backoff_max_ms: messaging.and_then(|m| m.relay_backoff_max_ms),
            shell_timeout_secs: self.tools.and_then(|t| t.shell_timeout_secs),
            journal_path: self.journal.and_then(|j| j.path).map(PathBuf::from),
        }
    }
}
