//! Organisation file loading (`[[agents]]` tables in TOML).

use std::path::Path;

use serde::Deserialize;

use super::{AgentSpec, Organization};
use crate::error::ConfigError;

#[derive(Debug, Deserialize, Default)]
pub struct OrgFile {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// Parse an organisation file's contents without validating the hierarchy.
pub fn parse_org(contents: &str, path: &Path) -> Result<OrgFile, ConfigError> {
    toml::from_str::<OrgFile>(contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load and validate an organisation file.
pub fn load_org_file(path: &Path) -> anyhow::Result<Organization> {
    let contents = std::fs::read_to_string(path).map_err(ConfigError::from)?;
    let file = parse_org(&contents, path)?;
    let count = file.agents.len();
    let org = Organization::from_specs(file.agents)?;
    tracing::info!(path = %path.display(), agents = count, "Organisation loaded");
    Ok(org)
}
