use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rankflow", version, about = "Rank-structured multi-agent orchestration runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit an objective to an entry agent and run until it settles
    Run {
        /// Organisation file (TOML)
        #[arg(long)]
        org: PathBuf,

        /// Agent that receives the root task
        #[arg(long)]
        entry: String,

        /// What the organisation should accomplish
        #[arg(long)]
        objective: String,

        /// Acceptance criterion; repeat for several
        #[arg(long = "criteria")]
        criteria: Vec<String>,

        /// Ollama model name (e.g., "llama3.2", "qwen2.5:7b")
        #[arg(short, long)]
        model: Option<String>,

        /// Workspace directory path
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Approve every operator-level request without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Print the organisation forest and each agent's approver
    Org {
        /// Organisation file (TOML)
        #[arg(long)]
        org: PathBuf,
    },
}
