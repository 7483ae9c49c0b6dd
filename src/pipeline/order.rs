//! Launch ordering for runs with declared predecessors.

use std::collections::{BTreeMap, BTreeSet};

/// Order `runs` (name, predecessor) so every run follows its predecessor.
///
/// Kahn's algorithm; among runs that are ready at the same time the one
/// defined first goes first. On a cycle, returns the names of every run that
/// could not be placed, in definition order.
///
/// Predecessors must name runs in the list; unknown names are the caller's
/// to reject beforehand.
pub fn launch_order(runs: &[(&str, Option<&str>)]) -> Result<Vec<usize>, Vec<String>> {
    let index: BTreeMap<&str, usize> = runs
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (*name, i))
        .collect();

    let mut waiting_on = vec![0usize; runs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); runs.len()];
    for (i, (_, after)) in runs.iter().enumerate() {
        if let Some(pred) = after.and_then(|p| index.get(p)) {
            waiting_on[i] += 1;
            dependents[*pred].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..runs.len()).filter(|&i| waiting_on[i] == 0).collect();
    let mut order = Vec::with_capacity(runs.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dep in &dependents[next] {
            waiting_on[dep] -= 1;
            if waiting_on[dep] == 0 {
                ready.insert(dep);
            }
        }
    }

    if order.len() < runs.len() {
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        return Err((0..runs.len())
            .filter(|i| !placed.contains(i))
            .map(|i| runs[i].0.to_string())
            .collect());
    }
    Ok(order)
}
