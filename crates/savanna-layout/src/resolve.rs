//! Layout resolution: per-run node counts, groups, and dependency regrouping.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{LayoutError, LayoutResult};
use crate::record::{NodeRecord, RunClaims};

/// What the resolver needs to know about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub name: String,
    pub nprocs: u32,
    /// Name of the run this one waits for, if any.
    pub depends_on: Option<String>,
}

impl RunRequest {
    pub fn new(name: impl Into<String>, nprocs: u32) -> Self {
        Self {
            name: name.into(),
            nprocs,
            depends_on: None,
        }
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.depends_on = Some(predecessor.into());
        self
    }
}

/// Per-rank core and GPU binding for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    /// `cpu[rank]` lists the core ids for that rank.
    pub cpu: Vec<Vec<u32>>,
    /// `gpu[rank]` lists the GPU ids for that rank.
    pub gpu: Vec<Vec<u32>>,
}

/// Where a run lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlacement {
    pub nodes: u32,
    pub tasks_per_node: u32,
    /// Index into [`ResolvedLayout::groups`].
    pub group: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_config: Option<NodeConfig>,
}

/// Runs sharing one set of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub runs: Vec<String>,
    pub nodes: u32,
}

/// Result of resolving a layout against a pipeline's runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedLayout {
    pub groups: Vec<Group>,
    pub placements: BTreeMap<String, RunPlacement>,
}

impl ResolvedLayout {
    /// Nodes the whole pipeline needs.
    pub fn total_nodes(&self) -> u32 {
        self.groups.iter().map(|g| g.nodes).sum()
    }

    pub fn placement(&self, run: &str) -> Option<&RunPlacement> {
        self.placements.get(run)
    }
}

struct Member {
    name: String,
    nodes: u32,
    claims: RunClaims,
}

fn ceil_div(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// Resolve `layout` for `runs` on nodes with `ppn` processes each.
///
/// With no layout (or an empty one) every run gets its own nodes, dependent
/// or not. Pure: the same inputs always yield the same result.
pub fn resolve(
    layout: Option<&[NodeRecord]>,
    runs: &[RunRequest],
    ppn: u32,
) -> LayoutResult<ResolvedLayout> {
    if ppn == 0 {
        return Err(LayoutError::ZeroProcessesPerNode);
    }
    for run in runs {
        if run.nprocs == 0 {
            return Err(LayoutError::ZeroProcesses {
                run: run.name.clone(),
            });
        }
    }

    let groups = match layout {
        Some(records) if !records.is_empty() => {
            let mut groups = groups_from_records(records, runs, ppn)?;
            regroup(&mut groups, runs, ppn);
            groups
        }
        _ => default_groups(runs, ppn),
    };
    Ok(finish(groups))
}

fn default_groups(runs: &[RunRequest], ppn: u32) -> Vec<Vec<Member>> {
    runs.iter()
        .map(|run| {
            let tpn = ppn.min(run.nprocs);
            vec![Member {
                name: run.name.clone(),
                nodes: ceil_div(run.nprocs, tpn),
                claims: RunClaims {
                    ranks_per_node: tpn,
                    ..RunClaims::default()
                },
            }]
        })
        .collect()
}

fn groups_from_records(
    records: &[NodeRecord],
    runs: &[RunRequest],
    ppn: u32,
) -> LayoutResult<Vec<Vec<Member>>> {
    let nprocs: BTreeMap<&str, u32> = runs.iter().map(|r| (r.name.as_str(), r.nprocs)).collect();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut groups = Vec::with_capacity(records.len());

    for (idx, record) in records.iter().enumerate() {
        let summary = record.summarize(idx)?;
        if let NodeRecord::Counts(counts) = record {
            let processes: u64 = counts.values().map(|&n| u64::from(n)).sum();
            if processes > u64::from(ppn) {
                return Err(LayoutError::OverSubscribed {
                    record: idx,
                    processes,
                    ppn,
                });
            }
        }
        let mut members = Vec::new();
        for (name, mut claims) in summary.runs {
            let Some(&procs) = nprocs.get(name.as_str()) else {
                return Err(LayoutError::UnknownRun { record: idx, run: name });
            };
            if let Some(&first) = seen.get(&name) {
                return Err(LayoutError::DuplicateRun {
                    run: name,
                    first,
                    second: idx,
                });
            }
            seen.insert(name.clone(), idx);

            if !claims.explicit {
                claims.ranks_per_node = claims.ranks_per_node.min(procs);
            }
            if claims.ranks_per_node == 0 {
                return Err(LayoutError::ZeroRanks { run: name });
            }
            members.push(Member {
                nodes: ceil_div(procs, claims.ranks_per_node),
                name,
                claims,
            });
        }
        groups.push(members);
    }

    for run in runs {
        if !seen.contains_key(&run.name) {
            return Err(LayoutError::MissingRun {
                run: run.name.clone(),
            });
        }
    }
    Ok(groups)
}

fn group_nodes(group: &[Member]) -> u32 {
    group.iter().map(|m| m.nodes).max().unwrap_or(0)
}

fn total(groups: &[Vec<Member>]) -> u32 {
    groups.iter().map(|g| group_nodes(g)).sum()
}

fn find(groups: &[Vec<Member>], name: &str) -> Option<usize> {
    groups
        .iter()
        .position(|g| g.iter().any(|m| m.name == name))
}

/// True when `candidate` can share nodes with every member of `group`.
fn fits(group: &[Member], candidate: &Member, ppn: u32) -> bool {
    let all_explicit = candidate.claims.explicit && group.iter().all(|m| m.claims.explicit);
    if all_explicit {
        let cores: BTreeSet<u32> = group.iter().flat_map(|m| m.claims.cores.iter().copied()).collect();
        let gpus: BTreeSet<u32> = group.iter().flat_map(|m| m.claims.gpus.iter().copied()).collect();
        cores.is_disjoint(&candidate.claims.cores) && gpus.is_disjoint(&candidate.claims.gpus)
    } else {
        let used: u32 = group.iter().map(|m| m.claims.ranks_per_node).sum();
        used + candidate.claims.ranks_per_node <= ppn
    }
}

fn regroup(groups: &mut Vec<Vec<Member>>, runs: &[RunRequest], ppn: u32) {
    // Each pass moves at most one run per dependency edge; a pass that moves
    // nothing ends the loop.
    for _ in 0..=runs.len() {
        let mut moved = false;
        for run in runs {
            let Some(pred) = run.depends_on.as_deref() else { continue };
            let (Some(from), Some(to)) = (find(groups, &run.name), find(groups, pred)) else {
                continue;
            };
            if from == to {
                continue;
            }
            let Some(pos) = groups[from].iter().position(|m| m.name == run.name) else {
                continue;
            };
            if !fits(&groups[to], &groups[from][pos], ppn) {
                continue;
            }

            let before = total(groups);
            let member = groups[from].remove(pos);
            groups[to].push(member);
            if total(groups) > before {
                if let Some(member) = groups[to].pop() {
                    groups[from].insert(pos, member);
                }
                continue;
            }
            moved = true;
        }
        if !moved {
            break;
        }
    }
    groups.retain(|g| !g.is_empty());
}

fn finish(groups: Vec<Vec<Member>>) -> ResolvedLayout {
    let mut placements = BTreeMap::new();
    let mut out = Vec::with_capacity(groups.len());
    for (idx, members) in groups.into_iter().enumerate() {
        let nodes = group_nodes(&members);
        let mut names = Vec::with_capacity(members.len());
        for m in members {
            let node_config = m.claims.explicit.then(|| NodeConfig {
                cpu: m.claims.cpu_by_rank,
                gpu: m.claims.gpu_by_rank,
            });
            placements.insert(
                m.name.clone(),
                RunPlacement {
                    nodes: m.nodes,
                    tasks_per_node: m.claims.ranks_per_node,
                    group: idx,
                    node_config,
                },
            );
            names.push(m.name);
        }
        out.push(Group { runs: names, nodes });
    }
    ResolvedLayout {
        groups: out,
        placements,
    }
}
