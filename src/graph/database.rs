use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{read_json, write_json};
use crate::errors::*;
use crate::graph::*;
use crate::lock::*;

/// A job as recorded by a previous run or submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub id: u64,
    pub name: String,
    pub tool: String,
    pub kind: ToolKind,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub command: String,
    pub inputs: FileParams,
    pub outputs: FileParams,
    pub state: JobState,
    #[serde(default)]
    pub dependencies: Vec<u64>,
    #[serde(default)]
    pub children: Vec<u64>,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

impl PersistedJob {
    /// Record for `job` without links; id 0 asks the database for a new id.
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.record.unwrap_or(0),
            name: job.name.clone(),
            tool: job.tool.clone(),
            kind: job.kind,
            pipeline: job.pipeline.clone(),
            command: job.command.clone(),
            inputs: job.inputs.clone(),
            outputs: job.outputs.clone(),
            state: job.state,
            dependencies: Vec::new(),
            children: Vec::new(),
            remote_id: job.remote_id.clone(),
            stdout: None,
            stderr: None,
        }
    }

    /// Graph node standing for this record. Edges are not restored.
    pub fn to_job(&self) -> Job {
        let mut job = Job::new(&self.name, &self.tool, self.kind);
        job.command = self.command.clone();
        job.inputs = self.inputs.clone();
        job.outputs = self.outputs.clone();
        job.pipeline = self.pipeline.clone();
        job.state = self.state;
        job.record = Some(self.id);
        job.remote_id = self.remote_id.clone();
        job
    }

    /// True if `job` is a new run of this record: same name, kind and files.
    pub fn is_run_of(&self, job: &Job) -> bool {
        self.name == job.name && self.kind == job.kind && self.inputs == job.inputs && self.outputs == job.outputs
    }

    /// True if this job declares every one of `inputs` and `outputs`.
    pub fn matches_files(&self, inputs: &[&str], outputs: &[&str]) -> bool {
        inputs.iter().all(|i| self.inputs.values().any(|v| v == i))
            && outputs.iter().all(|o| self.outputs.values().any(|v| v == o))
    }
}

pub trait JobDatabase {
    fn jobs(&self) -> Result<Vec<PersistedJob>>;

    fn get(&self, id: u64) -> Result<Option<PersistedJob>>;

    /// Store `job`, assigning a fresh id when its id is 0. Returns the id.
    fn save_job(&mut self, job: PersistedJob) -> Result<u64>;

    fn delete_job(&mut self, id: u64, clean_logs: bool) -> Result<Option<PersistedJob>>;

    fn update_state(&mut self, id: u64, state: JobState) -> Result<()> {
        let mut job = self.get(id)?.ok_or_else(|| Error::Store {
            store: "jobs".to_owned(),
            reason: format!("no job with id {id}"),
        })?;
        job.state = state;
        self.save_job(job)?;
        Ok(())
    }

    /// Jobs that declare all of the given input and output files.
    fn query_jobs_by_files(&self, inputs: &[&str], outputs: &[&str]) -> Result<Vec<PersistedJob>> {
        Ok(self
            .jobs()?
            .into_iter()
            .filter(|j| j.matches_files(inputs, outputs))
            .collect())
    }
}

fn clean_logs(job: &PersistedJob) {
    for log in [&job.stdout, &job.stderr].into_iter().flatten() {
        if log.exists() {
            if let Err(e) = fs::remove_file(log) {
                tracing::warn!(file = %log.display(), "failed to remove log file: {e}");
            }
        }
    }
}

/// Save `ids` with their links to `db` and remember the record ids in the
/// graph. A job without a record replaces the record of an earlier run of
/// the same job.
pub fn save_jobs(db: &mut dyn JobDatabase, graph: &mut JobGraph, ids: &[JobId]) -> Result<()> {
    let previous = db.jobs()?;
    for &id in ids {
        let job = graph.job_mut(id)?;
        if job.record.is_none() {
            job.record = previous.iter().find(|p| p.is_run_of(job)).map(|p| p.id);
        }
        let record = db.save_job(PersistedJob::from_job(job))?;
        job.record = Some(record);
    }

    let records = |graph: &JobGraph, links: &[JobId]| -> Vec<u64> {
        links
            .iter()
            .filter_map(|l| graph.get(*l).and_then(|j| j.record))
            .collect()
    };

    for &id in ids {
        let job = graph.job(id)?;
        let mut p = PersistedJob::from_job(job);
        p.dependencies = records(graph, &job.dependencies);
        p.children = records(graph, &job.children);
        if let Some(existing) = db.get(p.id)? {
            p.stdout = existing.stdout;
            p.stderr = existing.stderr;
        }
        db.save_job(p)?;
    }

    Ok(())
}

/// Remove the records of `ids` again, e.g. after a failed submission.
pub fn delete_jobs(db: &mut dyn JobDatabase, graph: &mut JobGraph, ids: &[JobId]) -> Result<()> {
    for &id in ids {
        let job = graph.job_mut(id)?;
        if let Some(record) = job.record.take() {
            db.delete_job(record, true)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobTable {
    next_id: u64,
    jobs: BTreeMap<u64, PersistedJob>,
}

impl JobTable {
    fn save(&mut self, mut job: PersistedJob) -> u64 {
        if job.id == 0 {
            self.next_id += 1;
            job.id = self.next_id;
        } else {
            self.next_id = self.next_id.max(job.id);
        }
        let id = job.id;
        self.jobs.insert(id, job);
        id
    }
}

/// Job records kept in one JSON file, locked for every access.
#[derive(Debug, Clone)]
pub struct JsonJobDatabase {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonJobDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<JobTable> {
        if !self.path.exists() {
            return Ok(JobTable::default());
        }
        let value = read_json(&self.path)?;
        serde_json::from_value(value).map_err(|e| Error::file_io(&self.path, e))
    }

    fn update<T>(&self, f: impl FnOnce(&mut JobTable) -> T) -> Result<T> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut table = self.read()?;
        let res = f(&mut table);
        write_json(&self.path, &table)?;
        Ok(res)
    }
}

impl JobDatabase for JsonJobDatabase {
    fn jobs(&self) -> Result<Vec<PersistedJob>> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        Ok(self.read()?.jobs.into_values().collect())
    }

    fn get(&self, id: u64) -> Result<Option<PersistedJob>> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        Ok(self.read()?.jobs.remove(&id))
    }

    fn save_job(&mut self, job: PersistedJob) -> Result<u64> {
        self.update(|t| t.save(job))
    }

    fn delete_job(&mut self, id: u64, clean: bool) -> Result<Option<PersistedJob>> {
        let removed = self.update(|t| {
            let removed = t.jobs.remove(&id);
            for j in t.jobs.values_mut() {
                j.dependencies.retain(|d| *d != id);
                j.children.retain(|c| *c != id);
            }
            removed
        })?;
        if clean {
            removed.iter().for_each(clean_logs);
        }
        Ok(removed)
    }
}

/// In process job records.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobDatabase {
    table: JobTable,
    deleted: Vec<u64>,
}

impl MemoryJobDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of deleted jobs in deletion order.
    pub fn deleted(&self) -> &[u64] {
        &self.deleted
    }
}

impl JobDatabase for MemoryJobDatabase {
    fn jobs(&self) -> Result<Vec<PersistedJob>> {
        Ok(self.table.jobs.values().cloned().collect())
    }

    fn get(&self, id: u64) -> Result<Option<PersistedJob>> {
        Ok(self.table.jobs.get(&id).cloned())
    }

    fn save_job(&mut self, job: PersistedJob) -> Result<u64> {
        Ok(self.table.save(job))
    }

    fn delete_job(&mut self, id: u64, clean: bool) -> Result<Option<PersistedJob>> {
        let removed = self.table.jobs.remove(&id);
        for j in self.table.jobs.values_mut() {
            j.dependencies.retain(|d| *d != id);
            j.children.retain(|c| *c != id);
        }
        if let Some(job) = &removed {
            self.deleted.push(id);
            if clean {
                clean_logs(job);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> JobGraph {
        let mut g = JobGraph::new();
        let mut index = Job::new("index.genome", "gem_index", ToolKind::Indexer);
        index.inputs = params([("input", "/refs/genome.fa")]);
        index.outputs = params([("output", "/refs/genome.gem")]);
        let mut t_index = Job::new("t_index.genome", "gem_t_index", ToolKind::TranscriptomeIndexer);
        t_index.inputs = params([("index", "/refs/genome.gem"), ("annotation", "/refs/a.gtf")]);
        t_index.outputs = params([("gem", "/refs/a.gtf.junctions.gem")]);
        let a = g.add(index);
        let b = g.add(t_index);
        g.add_edge(a, b).unwrap();
        g
    }

    fn check(db: &mut dyn JobDatabase) {
        let mut g = graph();
        let ids = g.ids().collect::<Vec<_>>();
        save_jobs(db, &mut g, &ids).unwrap();

        let index = g.job(JobId(0)).unwrap().record.unwrap();
        let t_index = g.job(JobId(1)).unwrap().record.unwrap();
        assert_eq!(db.get(t_index).unwrap().unwrap().dependencies, vec![index]);
        assert_eq!(db.get(index).unwrap().unwrap().children, vec![t_index]);

        let found = db
            .query_jobs_by_files(&["/refs/genome.fa"], &["/refs/genome.gem"])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "index.genome");
        assert!(db.query_jobs_by_files(&["/refs/other.fa"], &[]).unwrap().is_empty());

        db.update_state(index, JobState::Failed).unwrap();
        assert_eq!(db.get(index).unwrap().unwrap().state, JobState::Failed);

        db.delete_job(index, false).unwrap();
        assert!(db.get(index).unwrap().is_none());
        assert!(db.get(t_index).unwrap().unwrap().dependencies.is_empty());
    }

    #[test]
    fn memory_database() {
        check(&mut MemoryJobDatabase::new());
    }

    #[test]
    fn json_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".grape/jobs.db");
        check(&mut JsonJobDatabase::new(&path));

        let db = JsonJobDatabase::new(&path);
        assert_eq!(db.jobs().unwrap().len(), 1);
    }

    #[test]
    fn saving_a_rerun_replaces_its_record() {
        let mut db = MemoryJobDatabase::new();
        let mut first = graph();
        let ids = first.ids().collect::<Vec<_>>();
        save_jobs(&mut db, &mut first, &ids).unwrap();

        let mut second = graph();
        second.job_mut(JobId(0)).unwrap().state = JobState::Done;
        save_jobs(&mut db, &mut second, &ids).unwrap();

        assert_eq!(db.jobs().unwrap().len(), 2);
        for id in ids {
            assert_eq!(second.job(id).unwrap().record, first.job(id).unwrap().record);
        }
        let index = second.job(JobId(0)).unwrap().record.unwrap();
        assert_eq!(db.get(index).unwrap().unwrap().state, JobState::Done);

        let mut other = graph();
        other.job_mut(JobId(0)).unwrap().inputs = params([("input", "/refs/other.fa")]);
        save_jobs(&mut db, &mut other, &[JobId(0)]).unwrap();
        assert_eq!(db.jobs().unwrap().len(), 3);
    }

    #[test]
    fn persisted_job_restores_node() {
        let g = graph();
        let mut p = PersistedJob::from_job(g.job(JobId(0)).unwrap());
        p.id = 7;
        p.remote_id = Some("1234".to_owned());
        let job = p.to_job();
        assert_eq!(job.record, Some(7));
        assert_eq!(job.remote_id.as_deref(), Some("1234"));
        assert!(job.dependencies.is_empty());
    }
}
