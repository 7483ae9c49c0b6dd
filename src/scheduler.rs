//! Admission queue ordered by node cost.
//!
//! Jobs are kept sorted by cost with a binary-search insert. The scheduler
//! asks for the largest job that still fits in the free nodes, so big
//! pipelines go first whenever they can.

use std::sync::Mutex;

use thiserror::Error;

use crate::completion::lock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobListError {
    #[error("job list is empty")]
    Empty,
}

pub type JobListResult<T> = Result<T, JobListError>;

#[derive(Debug)]
pub struct JobList<J> {
    /// Ascending by cost; equal costs keep insertion order.
    jobs: Mutex<Vec<(u32, J)>>,
}

impl<J> JobList<J> {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn add_job(&self, job: J, cost: u32) {
        let mut jobs = lock(&self.jobs);
        let at = jobs.partition_point(|(c, _)| *c <= cost);
        jobs.insert(at, (cost, job));
    }

    /// Remove and return the costliest job with cost at most `max_cost`.
    ///
    /// `Ok(None)` when no job fits, `Err(Empty)` when there are no jobs.
    pub fn pop_job(&self, max_cost: u32) -> JobListResult<Option<(J, u32)>> {
        let mut jobs = lock(&self.jobs);
        if jobs.is_empty() {
            return Err(JobListError::Empty);
        }
        let fits = jobs.partition_point(|(c, _)| *c <= max_cost);
        if fits == 0 {
            return Ok(None);
        }
        let (cost, job) = jobs.remove(fits - 1);
        Ok(Some((job, cost)))
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.jobs).is_empty()
    }

    /// Drop every queued job, returning them in cost order.
    pub fn drain(&self) -> Vec<J> {
        lock(&self.jobs).drain(..).map(|(_, job)| job).collect()
    }
}

impl<J> Default for JobList<J> {
    fn default() -> Self {
        Self::new()
    }
}
