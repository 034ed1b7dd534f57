//! Cycle checks over the task graph.
//!
//! Edges run from a task to each of its dependencies and from a parent to
//! each of its children. A dependency edge that would make its source
//! reachable from its target is rejected.

use std::collections::{HashSet, VecDeque};

use super::{SubtaskSpec, TaskId};
use crate::error::{StoreError, ValidationError};

/// Order a batch of sibling subtasks so every dependency precedes its
/// dependents (Kahn's algorithm). Fails on out-of-range indices or cycles.
pub fn sibling_order(specs: &[SubtaskSpec]) -> Result<Vec<usize>, ValidationError> {
    let n = specs.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (index, spec) in specs.iter().enumerate() {
        let mut seen = HashSet::new();
        for &dep in &spec.depends_on {
            if dep >= n {
                return Err(ValidationError::BadSiblingIndex {
                    index,
                    depends_on: dep,
                });
            }
            if dep == index {
                return Err(ValidationError::DependencyCycle(format!("subtask #{index}")));
            }
            if seen.insert(dep) {
                indegree[index] += 1;
                dependents[dep].push(index);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n).find(|&i| indegree[i] > 0).unwrap_or(0);
        return Err(ValidationError::DependencyCycle(format!("subtask #{stuck}")));
    }
    Ok(order)
}

/// Whether `target` is reachable from `start` following `edges`.
pub fn reaches<F>(start: &str, target: &str, edges: F) -> Result<bool, StoreError>
where
    F: Fn(&str) -> Result<Vec<TaskId>, StoreError>,
{
    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut queue: VecDeque<TaskId> = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        if current == target {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        for next in edges(&current)? {
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    Ok(false)
}
