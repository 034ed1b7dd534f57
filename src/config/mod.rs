pub mod merge;
pub mod schema;

pub use schema::*;

use crate::agent::execution::LoopSettings;
use crate::agent::journal::Journal;
use crate::approval::NetworkAllowList;
use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use crate::messaging::RelayBackoff;
use crate::orchestration::RuntimeOptions;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load configuration by merging global, workspace, explicit and CLI sources.
/// Precedence: CLI > `--config` file > workspace config > global config > defaults.
///
/// Missing config files in the default locations are handled gracefully
/// (defaults apply). An explicitly named `--config` file must exist and parse.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/rankflow/rankflow.toml or platform equivalent)
    let global = load_global_config();

    // Layer 3: explicit --config file.
    let explicit = match cli_config_path(cli) {
        Some(path) => read_config_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PartialConfig::default(),
    };

    // Determine workspace path for loading the workspace config.
    let workspace_path = cli_workspace(cli)
        .or_else(|| explicit.workspace.clone())
        .or_else(|| global.workspace.clone())
        .unwrap_or_else(|| PathBuf::from("./workspace"));

    // Layer 2: Workspace config (workspace/rankflow.toml)
    let workspace = load_workspace_config(&workspace_path);

    // Layer 4: CLI args
    let cli_partial = cli_to_partial(cli);

    Ok(merge_layers(cli_partial, explicit, workspace, global))
}

/// CLI > explicit > workspace > global > defaults.
pub fn merge_layers(
    cli: PartialConfig,
    explicit: PartialConfig,
    workspace: PartialConfig,
    global: PartialConfig,
) -> AppConfig {
    cli.with_fallback(explicit)
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize()
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load workspace config from workspace/rankflow.toml.
/// Returns empty PartialConfig if file not found.
pub fn load_workspace_config(workspace_path: &Path) -> PartialConfig {
    let config_path = workspace_path.join("rankflow.toml");
    load_toml_file(&config_path).unwrap_or_default()
}

/// Read and parse a config file, surfacing every failure.
pub fn read_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents, path)
}

pub fn parse_config(contents: &str, path: &Path) -> Result<PartialConfig, ConfigError> {
    toml::from_str::<ConfigFile>(contents)
        .map(ConfigFile::to_partial)
        .map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and skipped.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match read_config_file(path) {
        Ok(partial) => {
            tracing::info!("Loaded config from {}", path.display());
            Some(partial)
        }
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Config skipped: {}", e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/rankflow/rankflow.toml
/// macOS: ~/Library/Application Support/rankflow/rankflow.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "rankflow")
        .map(|dirs| dirs.config_dir().join("rankflow.toml"))
}

fn cli_workspace(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { workspace, .. } => workspace.clone(),
        Commands::Org { .. } => None,
    }
}

fn cli_config_path(cli: &Cli) -> Option<&Path> {
    match &cli.command {
        Commands::Run { config, .. } => config.as_deref(),
        Commands::Org { .. } => None,
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Run {
            model, workspace, ..
        } => PartialConfig {
            model: model.clone(),
            workspace: workspace.clone(),
            ..Default::default()
        },
        Commands::Org { .. } => PartialConfig::default(),
    }
}

impl AppConfig {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    /// Build runtime tunables. Compiles the network allow-list, so a bad
    /// pattern fails here rather than at the first network request.
    pub fn runtime_options(&self, journal: Journal) -> Result<RuntimeOptions, ConfigError> {
        let network_allow_list = NetworkAllowList::new(&self.network_allow_list)?;
        let lock_ttl = Duration::from_secs(self.lock_ttl_secs);
        Ok(RuntimeOptions {
            settings: LoopSettings {
                model: self.model.clone(),
                reasoning_iterations: self.reasoning_iterations,
                context_budget: self.context_budget_tokens,
                activation_timeout: Duration::from_secs(self.activation_timeout_secs),
                lock_ttl,
            },
            max_open_tasks: self.max_open_tasks,
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
            network_allow_list,
            lock_reap_interval: Duration::from_millis(self.lock_reap_interval_ms),
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            relay_backoff: RelayBackoff {
                initial: Duration::from_millis(self.relay_backoff_ms),
                max: Duration::from_millis(self.relay_backoff_max_ms),
            },
            stall_threshold: Duration::from_secs(self.stall_threshold_secs),
            journal,
            ..RuntimeOptions::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn sections_flatten_into_partial() {
        let partial = parse_config(
            r#"
[general]
model = "qwen2.5:7b"

[limits]
max_open_tasks = 3
reasoning_iterations = 9

[approval]
timeout_secs = 30
network_allow_list = ["^https://docs\\.rs/"]

[locks]
ttl_secs = 60

[messaging]
relay_backoff_ms = 50

[journal]
path = "/tmp/journal.jsonl"
"#,
            Path::new("rankflow.toml"),
        )
        .unwrap();

        assert_eq!(partial.model.as_deref(), Some("qwen2.5:7b"));
        assert_eq!(partial.max_open_tasks, Some(3));
        assert_eq!(partial.reasoning_iterations, Some(9));
        assert_eq!(partial.approval_timeout_secs, Some(30));
        assert_eq!(partial.network_allow_list.as_ref().map(|v| v.len()), Some(1));
        assert_eq!(partial.lock_ttl_secs, Some(60));
        assert_eq!(partial.relay_backoff_ms, Some(50));
        assert_eq!(partial.journal_path, Some(PathBuf::from("/tmp/journal.jsonl")));
        assert_eq!(partial.context_budget_tokens, None);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = parse_config("[limits]\nmax_open_tasks = \"many\"", Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn workspace_file_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("rankflow.toml"),
            "[limits]\nstall_threshold_secs = 42\n",
        )
        .unwrap();
        let partial = load_workspace_config(dir.path());
        assert_eq!(partial.stall_threshold_secs, Some(42));

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(load_workspace_config(empty.path()), PartialConfig::default());
    }

    #[test]
    fn explicit_layer_sits_between_cli_and_workspace() {
        let config = merge_layers(
            PartialConfig {
                model: Some("cli-model".into()),
                ..Default::default()
            },
            PartialConfig {
                model: Some("explicit-model".into()),
                approval_timeout_secs: Some(5),
                ..Default::default()
            },
            PartialConfig {
                approval_timeout_secs: Some(99),
                lock_ttl_secs: Some(10),
                ..Default::default()
            },
            PartialConfig::default(),
        );
        assert_eq!(config.model, "cli-model");
        assert_eq!(config.approval_timeout_secs, 5);
        assert_eq!(config.lock_ttl_secs, 10);
    }

    #[test]
    fn cli_model_and_workspace_become_a_layer() {
        let cli = Cli::parse_from([
            "rankflow",
            "run",
            "--org",
            "org.toml",
            "--entry",
            "lead",
            "--objective",
            "ship it",
            "--model",
            "mistral",
            "--workspace",
            "/tmp/ws",
        ]);
        let partial = cli_to_partial(&cli);
        assert_eq!(partial.model.as_deref(), Some("mistral"));
        assert_eq!(partial.workspace, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn runtime_options_reject_bad_allow_list() {
        let mut config = PartialConfig::default().finalize();
        config.network_allow_list = vec!["([unclosed".into()];
        assert!(matches!(
            config.runtime_options(Journal::disabled()),
            Err(ConfigError::AllowListPattern(_))
        ));

        config.network_allow_list = vec!["^https://example\\.com/".into()];
        let options = config.runtime_options(Journal::disabled()).unwrap();
        assert!(options.network_allow_list.permits("https://example.com/a"));
        assert_eq!(options.settings.reasoning_iterations, 10);
        assert_eq!(options.relay_backoff.max, Duration::from_secs(5));
    }
}
