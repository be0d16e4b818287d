//! Job graphs built from tool pipelines.
//!
//! A [`JobGraph`] owns every [`Job`] of a run in an arena; edges are kept as
//! [`JobId`]s in both directions (`dependencies` and `children`). Graphs are
//! created from [`Pipeline`]s with [`create_jobs`], repaired against a
//! [`JobDatabase`] with [`check_jobs_dependencies`] and then run or submitted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::errors::*;

mod tools;
pub use tools::*;

mod pipeline;
pub use pipeline::*;

mod database;
pub use database::*;

mod repair;
pub use repair::*;

/// Named file parameters of a job, e.g. `input` or `bam`.
pub type FileParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        use JobState::*;
        match self {
            Queued => "QUEUED",
            Running => "RUNNING",
            Done => "DONE",
            Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Lifecycle transitions: `QUEUED -> RUNNING -> DONE` and
    /// `QUEUED | RUNNING -> FAILED`. Setting the current state again is allowed.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        *self == next
            || matches!(
                (self, next),
                (Queued, Running) | (Queued, Done) | (Running, Done) | (Queued, Failed) | (Running, Failed)
            )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Indexer,
    TranscriptomeIndexer,
    Aligner,
    Quantifier,
}

impl ToolKind {
    /// Setup jobs prepare shared references and can be reused across pipelines.
    pub fn is_setup(&self) -> bool {
        matches!(self, ToolKind::Indexer | ToolKind::TranscriptomeIndexer)
    }
}

/// One schedulable tool invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub tool: String,
    pub kind: ToolKind,
    pub command: String,
    pub inputs: FileParams,
    pub outputs: FileParams,
    pub config: JobConfig,
    pub pipeline: Option<String>,
    pub dependencies: Vec<JobId>,
    pub children: Vec<JobId>,
    pub state: JobState,
    /// Id of the persisted record, once saved to a job database.
    pub record: Option<u64>,
    /// Id assigned by the cluster on submission.
    pub remote_id: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, tool: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            kind,
            command: String::new(),
            inputs: FileParams::new(),
            outputs: FileParams::new(),
            config: JobConfig::default(),
            pipeline: None,
            dependencies: Vec::new(),
            children: Vec::new(),
            state: JobState::Queued,
            record: None,
            remote_id: None,
        }
    }

    pub fn input_files(&self) -> BTreeSet<&str> {
        self.inputs.values().map(String::as_str).collect()
    }

    pub fn output_files(&self) -> BTreeSet<&str> {
        self.outputs.values().map(String::as_str).collect()
    }

    /// Two jobs are the same work if they share name and outputs.
    pub fn same_work(&self, other: &Job) -> bool {
        self.name == other.name && self.outputs == other.outputs
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: Job) -> JobId {
        self.jobs.push(job);
        JobId(self.jobs.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id.0)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id.0)
    }

    pub fn job(&self, id: JobId) -> Result<&Job> {
        self.get(id).ok_or_else(|| Error::Graph(format!("unknown job {id}")))
    }

    pub fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id.0)
            .ok_or_else(|| Error::Graph(format!("unknown job {id}")))
    }

    pub fn ids(&self) -> impl Iterator<Item = JobId> {
        (0..self.jobs.len()).map(JobId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobId, &Job)> {
        self.jobs.iter().enumerate().map(|(i, j)| (JobId(i), j))
    }

    pub fn find(&self, name: &str) -> Option<JobId> {
        self.iter().find(|(_, j)| j.name == name).map(|(id, _)| id)
    }

    /// Make `child` wait for `parent`.
    pub fn add_edge(&mut self, parent: JobId, child: JobId) -> Result<()> {
        if parent == child {
            return Err(Error::Graph(format!("job {parent} cannot depend on itself")));
        }
        let p = self.job_mut(parent)?;
        if !p.children.contains(&child) {
            p.children.push(child);
        }
        let c = self.job_mut(child)?;
        if !c.dependencies.contains(&parent) {
            c.dependencies.push(parent);
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, parent: JobId, child: JobId) {
        if let Some(p) = self.get_mut(parent) {
            p.children.retain(|c| *c != child);
        }
        if let Some(c) = self.get_mut(child) {
            c.dependencies.retain(|d| *d != parent);
        }
    }

    /// `id` and every job it transitively depends on, depth first.
    pub fn dependency_closure(&self, id: JobId) -> Vec<JobId> {
        self.walk(id, |j| &j.dependencies)
    }

    /// `id` and every job that transitively depends on it, depth first.
    pub fn descendants(&self, id: JobId) -> Vec<JobId> {
        self.walk(id, |j| &j.children)
    }

    fn walk(&self, start: JobId, next: impl Fn(&Job) -> &Vec<JobId>) -> Vec<JobId> {
        let mut seen = BTreeSet::new();
        let mut res = Vec::new();
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(job) = self.get(id) else {
                continue;
            };
            res.push(id);
            stack.extend(next(job).iter().rev().copied());
        }

        res
    }

    /// Set the state of `id` and all of its descendants.
    pub fn propagate_state(&mut self, id: JobId, state: JobState) {
        for d in self.descendants(id) {
            if let Some(j) = self.get_mut(d) {
                j.state = state;
            }
        }
    }

    /// Order `subset` so that every job comes after its dependencies. Edges
    /// to jobs outside of `subset` are ignored. Ties keep id order.
    pub fn topological_order(&self, subset: &[JobId]) -> Result<Vec<JobId>> {
        let members = subset.iter().copied().collect::<BTreeSet<_>>();
        let mut pending = BTreeMap::new();
        for &id in &members {
            let job = self.job(id)?;
            let n = job.dependencies.iter().filter(|d| members.contains(d)).count();
            pending.insert(id, n);
        }

        let mut ready = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>();
        let mut res = Vec::with_capacity(members.len());

        while let Some(id) = ready.pop_first() {
            res.push(id);
            for child in &self.job(id)?.children {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if res.len() != members.len() {
            return Err(Error::Graph("dependency cycle between jobs".to_owned()));
        }
        Ok(res)
    }
}
