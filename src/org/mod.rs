//! Organisational hierarchy arena.
//!
//! Agents are stored by identifier; `reports_to` and `subordinates` are
//! identifier sets rather than owning references, so removing an agent is a
//! tombstone flip instead of a graph surgery. Ranks strictly decrease along
//! `reports_to`, which rules out reporting cycles.

pub mod loader;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::tasks::TaskId;

/// Identifier of an agent (human operator or autonomous unit).
pub type AgentId = String;

/// Rank of the human operator at the top of each reporting tree.
pub const OPERATOR_RANK: u8 = 0;

/// Rank of the coordination tier. Their approvals always go to rank 0.
pub const COORDINATION_RANK: u8 = 1;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    WaitingApproval,
    Reviewing,
    Blocked,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::WaitingApproval => "waiting_approval",
            AgentStatus::Reviewing => "reviewing",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Declarative description of an agent, as found in organisation files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    pub rank: u8,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub reports_to: Option<AgentId>,
}

impl AgentSpec {
    pub fn new(id: &str, rank: u8, department: &str, reports_to: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            rank,
            department: department.to_string(),
            reports_to: reports_to.map(str::to_string),
        }
    }
}

/// Snapshot of an agent record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub rank: u8,
    pub department: String,
    pub reports_to: Option<AgentId>,
    pub subordinates: BTreeSet<AgentId>,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub archived: bool,
}

impl AgentRecord {
    fn from_spec(spec: AgentSpec) -> Self {
        let name = if spec.name.is_empty() {
            spec.id.clone()
        } else {
            spec.name
        };
        Self {
            id: spec.id,
            name,
            rank: spec.rank,
            department: spec.department,
            reports_to: spec.reports_to,
            subordinates: BTreeSet::new(),
            status: AgentStatus::Idle,
            current_task: None,
            archived: false,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.rank == OPERATOR_RANK
    }

    /// Execution-tier agents (rank 2+) are subject to the open-task limit.
    pub fn is_execution_tier(&self) -> bool {
        self.rank > COORDINATION_RANK
    }
}

/// Arena of agent records indexed by identifier.
#[derive(Debug, Default)]
pub struct Organization {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl Organization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an organisation from a batch of specs in any order.
    ///
    /// Validates unique ids, that rank 0 has no superior, that every other
    /// agent reports to an existing agent exactly one rank above it, and that
    /// the reporting relation is a forest.
    pub fn from_specs(specs: Vec<AgentSpec>) -> Result<Self, ValidationError> {
        let mut agents: HashMap<AgentId, AgentRecord> = HashMap::new();
        for spec in specs {
            if agents.contains_key(&spec.id) {
                return Err(ValidationError::DuplicateAgent(spec.id));
            }
            agents.insert(spec.id.clone(), AgentRecord::from_spec(spec));
        }

        for record in agents.values() {
            validate_edge(record, |id| agents.get(id).map(|r| r.rank))?;
        }

        for id in agents.keys() {
            let mut seen = BTreeSet::new();
            let mut cursor = Some(id.clone());
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(ValidationError::ReportingCycle(current));
                }
                cursor = agents.get(&current).and_then(|r| r.reports_to.clone());
            }
        }

        let edges: Vec<(AgentId, AgentId)> = agents
            .values()
            .filter_map(|r| r.reports_to.clone().map(|sup| (sup, r.id.clone())))
            .collect();
        for (superior, subordinate) in edges {
            if let Some(record) = agents.get_mut(&superior) {
                record.subordinates.insert(subordinate);
            }
        }

        Ok(Self {
            agents: RwLock::new(agents),
        })
    }

    /// Add one agent under an existing superior.
    pub fn hire(&self, spec: AgentSpec) -> Result<(), ValidationError> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(&spec.id) {
            return Err(ValidationError::DuplicateAgent(spec.id));
        }
        let record = AgentRecord::from_spec(spec);
        validate_edge(&record, |id| {
            agents.get(id).filter(|r| !r.archived).map(|r| r.rank)
        })?;
        if let Some(superior) = record.reports_to.clone() {
            if let Some(sup) = agents.get_mut(&superior) {
                sup.subordinates.insert(record.id.clone());
            }
        }
        tracing::info!(agent = %record.id, rank = record.rank, "Agent hired");
        agents.insert(record.id.clone(), record);
        Ok(())
    }

    /// Tombstone an agent. Callers must reassign its open tasks first.
    pub fn archive(&self, id: &str) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let superior = match agents.get_mut(id) {
            Some(record) if !record.archived => {
                record.archived = true;
                record.status = AgentStatus::Idle;
                record.current_task = None;
                record.reports_to.clone()
            }
            _ => return false,
        };
        if let Some(sup) = superior.and_then(|s| agents.get_mut(&s)) {
            sup.subordinates.remove(id);
        }
        tracing::info!(agent = %id, "Agent archived");
        true
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(id).cloned()
    }

    /// Whether `id` names a non-archived agent.
    pub fn is_active(&self, id: &str) -> bool {
        self.get(id).map(|r| !r.archived).unwrap_or(false)
    }

    pub fn rank_of(&self, id: &str) -> Option<u8> {
        self.get(id).map(|r| r.rank)
    }

    pub fn superior_of(&self, id: &str) -> Option<AgentId> {
        self.get(id).and_then(|r| r.reports_to)
    }

    /// Superiors of `id` from the direct superior up to the root.
    pub fn chain_to_root(&self, id: &str) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut chain = Vec::new();
        let mut cursor = agents.get(id).and_then(|r| r.reports_to.clone());
        while let Some(current) = cursor {
            if chain.contains(&current) {
                break;
            }
            cursor = agents.get(&current).and_then(|r| r.reports_to.clone());
            chain.push(current);
        }
        chain
    }

    /// The rank-0 root of the tree containing `id` (its organisational scope).
    pub fn root_of(&self, id: &str) -> Option<AgentId> {
        let record = self.get(id)?;
        if record.reports_to.is_none() {
            return Some(record.id);
        }
        self.chain_to_root(id).pop()
    }

    pub fn same_scope(&self, a: &str, b: &str) -> bool {
        match (self.root_of(a), self.root_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Whether `ancestor` appears anywhere above `id` in the reporting chain.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        self.chain_to_root(id).iter().any(|a| a == ancestor)
    }

    pub fn is_direct_subordinate(&self, superior: &str, subordinate: &str) -> bool {
        self.get(subordinate)
            .map(|r| !r.archived && r.reports_to.as_deref() == Some(superior))
            .unwrap_or(false)
    }

    pub fn direct_subordinates(&self, id: &str) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .get(id)
            .map(|r| {
                r.subordinates
                    .iter()
                    .filter(|s| agents.get(*s).map(|a| !a.archived).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn department_members(&self, department: &str) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<AgentId> = agents
            .values()
            .filter(|r| !r.archived && r.department == department)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All active agents whose reporting tree is rooted at `root`.
    pub fn scope_members(&self, root: &str) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .active_ids()
            .into_iter()
            .filter(|id| self.root_of(id).as_deref() == Some(root))
            .collect();
        ids.sort();
        ids
    }

    pub fn active_ids(&self) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<AgentId> = agents
            .values()
            .filter(|r| !r.archived)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn roots(&self) -> Vec<AgentId> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<AgentId> = agents
            .values()
            .filter(|r| !r.archived && r.reports_to.is_none())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn status_of(&self, id: &str) -> Option<AgentStatus> {
        self.get(id).map(|r| r.status)
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = agents.get_mut(id) {
            if record.status != status {
                tracing::debug!(agent = %id, from = %record.status, to = %status, "Agent status changed");
                record.status = status;
            }
        }
    }

    pub fn set_current_task(&self, id: &str, task: Option<TaskId>) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = agents.get_mut(id) {
            record.current_task = task;
        }
    }
}

fn validate_edge(
    record: &AgentRecord,
    rank_lookup: impl Fn(&str) -> Option<u8>,
) -> Result<(), ValidationError> {
    match (&record.reports_to, record.rank) {
        (Some(_), OPERATOR_RANK) => Err(ValidationError::OperatorWithSuperior(record.id.clone())),
        (None, OPERATOR_RANK) => Ok(()),
        (None, _) => Err(ValidationError::MissingSuperior(record.id.clone())),
        (Some(superior), rank) => {
            let superior_rank =
                rank_lookup(superior).ok_or_else(|| ValidationError::UnknownSuperior {
                    agent: record.id.clone(),
                    superior: superior.clone(),
                })?;
            if superior_rank + 1 != rank {
                return Err(ValidationError::RankMismatch {
                    agent: record.id.clone(),
                    rank,
                    superior: superior.clone(),
                    superior_rank,
                });
            }
            Ok(())
        }
    }
}
