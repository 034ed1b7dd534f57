use super::schema::{AppConfig, PartialConfig};
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For network_allow_list: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            model: self.model.or(fallback.model),
            workspace: self.workspace.or(fallback.workspace),
            reasoning_iterations: self.reasoning_iterations.or(fallback.reasoning_iterations),
            context_budget_tokens: self.context_budget_tokens.or(fallback.context_budget_tokens),
            max_open_tasks: self.max_open_tasks.or(fallback.max_open_tasks),
            activation_timeout_secs: self.activation_timeout_secs.or(fallback.activation_timeout_secs),
            stall_threshold_secs: self.stall_threshold_secs.or(fallback.stall_threshold_secs),
            approval_timeout_secs: self.approval_timeout_secs.or(fallback.approval_timeout_secs),
            network_allow_list: self.network_allow_list.or(fallback.network_allow_list),
            lock_ttl_secs: self.lock_ttl_secs.or(fallback.lock_ttl_secs),
            lock_reap_interval_ms: self.lock_reap_interval_ms.or(fallback.lock_reap_interval_ms),
            default_ttl_secs: self.default_ttl_secs.or(fallback.default_ttl_secs),
            relay_backoff_ms: self.relay_backoff_ms.or(fallback.relay_backoff_ms),
            relay_backoff_max_ms: self.relay_backoff_max_ms.or(fallback.relay_backoff_max_ms),
            shell_timeout_secs: self.shell_timeout_secs.or(fallback.shell_timeout_secs),
            journal_path: self.journal_path.or(fallback.journal_path),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        AppConfig {
            model: self.model.unwrap_or_else(|| "llama3.2".to_string()),
            workspace: self
                .workspace
                .unwrap_or_else(|| PathBuf::from("./workspace")),
            reasoning_iterations: self.reasoning_iterations.unwrap_or(10).clamp(8, 12),
            context_budget_tokens: self.context_budget_tokens.unwrap_or(150_000),
            max_open_tasks: self.max_open_tasks.unwrap_or(5),
            activation_timeout_secs: self.activation_timeout_secs.unwrap_or(1800),
            stall_threshold_secs: self.stall_threshold_secs.unwrap_or(300),
            approval_timeout_secs: self.approval_timeout_secs.unwrap_or(600),
            network_allow_list: self.network_allow_list.unwrap_or_default(),
            lock_ttl_secs: self.lock_ttl_secs.unwrap_or(300),
            lock_reap_interval_ms: self.lock_reap_interval_ms.unwrap_or(1000),
            default_ttl_secs: self.default_ttl_secs.unwrap_or(3600),
            relay_backoff_ms: self.relay_backoff_ms.unwrap_or(100),
            relay_backoff_max_ms: self.relay_backoff_max_ms.unwrap_or(5000),
            shell_timeout_secs: self.shell_timeout_secs.unwrap_or(30),
            journal_path: self.journal_path,
        }
    }
}
