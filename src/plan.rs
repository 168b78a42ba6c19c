//! Dependency planning
//!
//! Produces the linear startup order for a topology: every service appears
//! after all services it depends on, and ties among independent services are
//! broken by declaration order so the plan is deterministic. Teardown is the
//! exact reverse of the startup order.

use crate::error::{BerthError, Result};
use crate::spec::Topology;
use std::collections::BTreeSet;

/// Compute the startup order for a topology
pub fn startup_order(topology: &Topology) -> Result<Vec<String>> {
    let n = topology.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, service) in topology.services().iter().enumerate() {
        for dep in &service.depends_on {
            let j = topology
                .position(dep)
                .ok_or_else(|| BerthError::ServiceNotFound(dep.clone()))?;
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    // Kahn's algorithm over declaration indices; the BTreeSet hands back the
    // lowest-index ready service, which is the declaration-order tie-break.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(&i) = ready.iter().next() {
        ready.remove(&i);
        order.push(i);
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < n {
        let mut remaining: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] > 0).collect();

        // Strip services that are merely blocked downstream of a cycle; a
        // cycle member always has a dependent among the remaining services.
        loop {
            let tail: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| !dependents[i].iter().any(|d| remaining.contains(d)))
                .collect();
            if tail.is_empty() {
                break;
            }
            for i in tail {
                remaining.remove(&i);
            }
        }

        let names = remaining
            .into_iter()
            .map(|i| topology.services()[i].name.clone())
            .collect();
        return Err(BerthError::Cycle(names));
    }

    Ok(order
        .into_iter()
        .map(|i| topology.services()[i].name.clone())
        .collect())
}

/// Teardown order: the exact reverse of a startup order
pub fn teardown_order(startup: &[String]) -> Vec<String> {
    startup.iter().rev().cloned().collect()
}
