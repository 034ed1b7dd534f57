use std::fmt;

use serde::{Deserialize, Serialize};

/// Risk classification declared by every tool.
///
/// | tier    | examples                    | requirement                              |
/// |---------|-----------------------------|------------------------------------------|
/// | low     | read, list, search          | proceed immediately                      |
/// | medium  | write, create, install      | approver must approve                    |
/// | high    | delete, format, system exec | approver must approve                    |
/// | network | outbound request            | allow-listed resource, then approver     |
///
/// The table is fixed policy; callers cannot override it per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Network,
}

impl RiskTier {
    pub fn requires_approval(&self) -> bool {
        !matches!(self, RiskTier::Low)
    }

    /// Network actions are default-deny unless the resource is allow-listed.
    pub fn requires_allow_list(&self) -> bool {
        matches!(self, RiskTier::Network)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Network => "network",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
