//! Fixed pool of node identities shared by running pipelines.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::completion::lock;

/// Identity of one allocable node, `"1"` through `"N"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct PoolState {
    free: VecDeque<NodeId>,
    halted: bool,
}

/// Free node ids behind one mutex and condition variable.
///
/// Waiters are woken whenever nodes come back or the pool is halted.
#[derive(Debug)]
pub struct NodePool {
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl NodePool {
    pub fn new(capacity: u32) -> Self {
        let free = (1..=capacity).map(|i| NodeId(i.to_string())).collect();
        Self {
            state: Mutex::new(PoolState { free, halted: false }),
            changed: Condvar::new(),
        }
    }

    pub fn free(&self) -> u32 {
        lock(&self.state).free.len() as u32
    }

    /// Wait until `pick(free)` chooses a size that can be satisfied, then
    /// take that many ids. `pick` returning `None` keeps waiting.
    ///
    /// Returns `None` once the pool is halted.
    pub fn take_when<T, F>(&self, mut pick: F) -> Option<(T, Vec<NodeId>)>
    where
        F: FnMut(u32) -> Option<(T, u32)>,
    {
        let mut state = lock(&self.state);
        loop {
            if state.halted {
                return None;
            }
            if let Some((value, n)) = pick(state.free.len() as u32) {
                if let Some(ids) = take_from(&mut state.free, n) {
                    return Some((value, ids));
                }
                tracing::error!(requested = n, free = state.free.len(), "picked more nodes than are free");
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn give_back(&self, ids: Vec<NodeId>) {
        if ids.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        state.free.extend(ids);
        self.changed.notify_all();
    }

    /// Wake every waiter; `take_when` returns `None` from now on.
    pub fn halt(&self) {
        lock(&self.state).halted = true;
        self.changed.notify_all();
    }

    /// Wake every waiter without changing anything.
    pub fn notify(&self) {
        let _guard = lock(&self.state);
        self.changed.notify_all();
    }
}

fn take_from(free: &mut VecDeque<NodeId>, n: u32) -> Option<Vec<NodeId>> {
    let n = n as usize;
    if n > free.len() {
        return None;
    }
    Some(free.drain(..n).collect())
}
