//! Node record forms accepted in a pipeline's `node_layout`.
//!
//! Two shapes are accepted:
//! - count maps: `{"sim": 4, "viz": 2}`, codes sharing a node with a
//!   processes-per-node figure each
//! - resource records: `{"__info_type__": "NodeConfig", "cpu": [...], "gpu": [...]}`
//!   where every core index maps to `name:rank` and every GPU index maps to a
//!   list of `name:rank`

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, LayoutResult};

/// One compute node's worth of placement information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRecord {
    /// Explicit core and GPU mapping.
    Resources(ResourceRecord),
    /// Run name to processes per node.
    Counts(BTreeMap<String, u32>),
}

/// Core/GPU mapping for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "__info_type__", default, skip_serializing_if = "Option::is_none")]
    pub info_type: Option<String>,

    /// Index is the core id; `None` leaves the core idle.
    pub cpu: Vec<Option<CoreClaim>>,

    /// Index is the GPU id; each entry lists the ranks bound to it.
    #[serde(default)]
    pub gpu: Vec<Option<Vec<String>>>,
}

/// A core is normally claimed by one rank, but a list is accepted so that
/// over-subscription can be expressed (and rejected when it crosses codes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoreClaim {
    One(String),
    Many(Vec<String>),
}

impl CoreClaim {
    fn refs(&self) -> Vec<&str> {
        match self {
            CoreClaim::One(s) => vec![s.as_str()],
            CoreClaim::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// A parsed `name:rank` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankRef {
    pub run: String,
    pub rank: u32,
}

impl RankRef {
    pub fn parse(record: usize, value: &str) -> LayoutResult<Self> {
        let malformed = || LayoutError::MalformedRank {
            record,
            value: value.to_string(),
        };
        let (run, rank) = value.rsplit_once(':').ok_or_else(malformed)?;
        if run.is_empty() {
            return Err(malformed());
        }
        let rank = rank.trim().parse::<u32>().map_err(|_| malformed())?;
        Ok(Self {
            run: run.to_string(),
            rank,
        })
    }
}

/// What one run claims on one node record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunClaims {
    /// Ranks of this run placed on the node.
    pub ranks_per_node: u32,
    /// Core ids used, empty for count records.
    pub cores: BTreeSet<u32>,
    /// GPU ids used, empty for count records.
    pub gpus: BTreeSet<u32>,
    /// Per-rank core lists (resource records only).
    pub cpu_by_rank: Vec<Vec<u32>>,
    /// Per-rank GPU lists (resource records only).
    pub gpu_by_rank: Vec<Vec<u32>>,
    /// True when the claims came from a resource record.
    pub explicit: bool,
}

/// Per-record summary: run names in first-appearance order with their claims.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordSummary {
    pub runs: Vec<(String, RunClaims)>,
}

impl NodeRecord {
    /// Validate the record and compute per-run claims.
    pub(crate) fn summarize(&self, record: usize) -> LayoutResult<RecordSummary> {
        match self {
            NodeRecord::Counts(map) => {
                let mut summary = RecordSummary::default();
                for (run, &count) in map {
                    if count == 0 {
                        return Err(LayoutError::ZeroRanks { run: run.clone() });
                    }
                    summary.runs.push((
                        run.clone(),
                        RunClaims {
                            ranks_per_node: count,
                            ..RunClaims::default()
                        },
                    ));
                }
                Ok(summary)
            }
            NodeRecord::Resources(res) => res.summarize(record),
        }
    }
}

impl ResourceRecord {
    /// Every rank needs a core of its own on this node, so a local rank can
    /// never reach the number of core slots.
    fn rank_ref(&self, record: usize, value: &str) -> LayoutResult<RankRef> {
        let r = RankRef::parse(record, value)?;
        if r.rank as usize >= self.cpu.len() {
            return Err(LayoutError::MalformedRank {
                record,
                value: value.to_string(),
            });
        }
        Ok(r)
    }

    fn summarize(&self, record: usize) -> LayoutResult<RecordSummary> {
        let mut order: Vec<String> = Vec::new();
        let mut ranks: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        let mut core_owner: BTreeMap<u32, String> = BTreeMap::new();
        let mut gpu_owner: BTreeMap<u32, String> = BTreeMap::new();
        let mut cpu_pairs: Vec<(RankRef, u32)> = Vec::new();
        let mut gpu_pairs: Vec<(RankRef, u32)> = Vec::new();

        for (core, claim) in self.cpu.iter().enumerate() {
            let Some(claim) = claim else { continue };
            let core = core as u32;
            for value in claim.refs() {
                let r = self.rank_ref(record, value)?;
                if let Some(owner) = core_owner.get(&core) {
                    if owner != &r.run {
                        return Err(LayoutError::CoreConflict {
                            record,
                            index: core,
                            first: owner.clone(),
                            second: r.run,
                        });
                    }
                } else {
                    core_owner.insert(core, r.run.clone());
                }
                if !ranks.contains_key(&r.run) {
                    order.push(r.run.clone());
                }
                ranks.entry(r.run.clone()).or_default().insert(r.rank);
                cpu_pairs.push((r, core));
            }
        }

        for (gpu, claim) in self.gpu.iter().enumerate() {
            let Some(values) = claim else { continue };
            let gpu = gpu as u32;
            for value in values {
                let r = self.rank_ref(record, value)?;
                if let Some(owner) = gpu_owner.get(&gpu) {
                    if owner != &r.run {
                        return Err(LayoutError::GpuConflict {
                            record,
                            index: gpu,
                            first: owner.clone(),
                            second: r.run,
                        });
                    }
                } else {
                    gpu_owner.insert(gpu, r.run.clone());
                }
                gpu_pairs.push((r, gpu));
            }
        }

        // A GPU-only rank without cores cannot be launched.
        for (r, _) in &gpu_pairs {
            if !ranks.contains_key(&r.run) {
                return Err(LayoutError::ZeroRanks { run: r.run.clone() });
            }
        }

        let mut summary = RecordSummary::default();
        for run in order {
            let run_ranks = &ranks[&run];
            let slots = run_ranks.iter().max().map(|m| *m as usize + 1).unwrap_or(0);
            let mut claims = RunClaims {
                ranks_per_node: run_ranks.len() as u32,
                explicit: true,
                cpu_by_rank: vec![Vec::new(); slots],
                gpu_by_rank: vec![Vec::new(); slots],
                ..RunClaims::default()
            };
            for (r, core) in cpu_pairs.iter().filter(|(r, _)| r.run == run) {
                claims.cores.insert(*core);
                claims.cpu_by_rank[r.rank as usize].push(*core);
            }
            for (r, gpu) in gpu_pairs.iter().filter(|(r, _)| r.run == run) {
                claims.gpus.insert(*gpu);
                if let Some(slot) = claims.gpu_by_rank.get_mut(r.rank as usize) {
                    slot.push(*gpu);
                }
            }
            summary.runs.push((run, claims));
        }
        Ok(summary)
    }
}
