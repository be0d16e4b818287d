use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{read_json, write_json};
use crate::errors::*;
use crate::graph::JobState;
use crate::lock::*;

pub const JOBS_DIR: &str = ".grape/jobs";

/// Submission record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
    pub state: JobState,
}

impl StoreEntry {
    pub fn queued() -> Self {
        Self {
            id: None,
            stdout: None,
            stderr: None,
            state: JobState::Queued,
        }
    }
}

/// Contents of a store file: the pipeline name plus one entry per job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    pub name: String,
    #[serde(flatten)]
    pub jobs: BTreeMap<String, StoreEntry>,
}

impl StoreData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: BTreeMap::new(),
        }
    }
}

/// File backed job states of one pipeline run, stored under `.grape/jobs`.
#[derive(Debug)]
pub struct PipelineStore {
    project: PathBuf,
    name: String,
    storage: PathBuf,
    lock: Option<FileLock>,
    lock_timeout: Duration,
}

impl PipelineStore {
    pub fn new(project: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let project = project.into();
        let name = name.into();
        let storage = project.join(JOBS_DIR).join(name.replace(' ', "_"));
        Self {
            project,
            name,
            storage,
            lock: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn get(&self) -> Result<StoreData> {
        if !self.storage.exists() {
            return Ok(StoreData::new(&self.name));
        }
        let value = read_json(&self.storage)?;
        serde_json::from_value(value).map_err(|e| Error::Store {
            store: self.storage.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, data: &StoreData) -> Result<()> {
        write_json(&self.storage, data)
    }

    /// Overwrite the entry of `job`. Callers hold the lock.
    pub fn set(&self, job: &str, entry: StoreEntry) -> Result<()> {
        let mut data = self.get()?;
        data.jobs.insert(job.to_owned(), entry);
        self.save(&data)
    }

    /// Record the scheduler id and log files of `job` without touching its
    /// state, which the job may already have reported. Callers hold the lock.
    pub fn set_submission(&self, job: &str, id: &str, stdout: &Path, stderr: &Path) -> Result<()> {
        let mut data = self.get()?;
        let entry = data.jobs.entry(job.to_owned()).or_insert_with(StoreEntry::queued);
        entry.id = Some(id.to_owned());
        entry.stdout = Some(stdout.to_path_buf());
        entry.stderr = Some(stderr.to_path_buf());
        self.save(&data)
    }

    /// Lock the store file. Returns `false` if this store already holds the lock.
    pub fn lock(&mut self) -> Result<bool> {
        if self.lock.is_some() {
            return Ok(false);
        }
        self.lock = Some(FileLock::acquire(&self.storage, self.lock_timeout)?);
        Ok(true)
    }

    /// Release the lock. Returns `false` when it was not held.
    pub fn release(&mut self) -> bool {
        self.lock.take().is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Run `f` with the store locked, releasing a lock taken here afterwards.
    pub fn locked<T>(&mut self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let acquired = self.lock()?;
        let res = f(self);
        if acquired {
            self.release();
        }
        res
    }

    /// Move the entry of `job` to `state`. The entry must exist. Transitions
    /// out of DONE or FAILED are ignored. Returns the stored state.
    pub fn update_state(&mut self, job: &str, state: JobState) -> Result<JobState> {
        self.locked(|store| {
            let mut data = store.get()?;
            let entry = data.jobs.get_mut(job).ok_or_else(|| Error::Store {
                store: store.name.clone(),
                reason: format!("no entry for job \"{job}\""),
            })?;

            if !entry.state.can_transition_to(state) {
                tracing::warn!(
                    store = %store.name,
                    job,
                    "ignoring state change {} -> {state}",
                    entry.state
                );
                return Ok(entry.state);
            }

            entry.state = state;
            store.save(&data)?;
            Ok(state)
        })
    }

    /// Every store of `project`.
    pub fn list(project: impl AsRef<Path>) -> Result<Vec<PipelineStore>> {
        let project = project.as_ref();
        let dir = project.join(JOBS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut res = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::file_io(&dir, e))? {
            let path = entry.map_err(|e| Error::file_io(&dir, e))?.path();
            let is_store = path.is_file()
                && path
                    .extension()
                    .map(|ext| ext != "lock" && ext != "tmp")
                    .unwrap_or(true);
            if !is_store {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut store = PipelineStore::new(project, file_name);
            if let Ok(data) = store.get() {
                store.name = data.name;
            }
            res.push(store);
        }

        res.sort_by(|a, b| a.storage.cmp(&b.storage));
        Ok(res)
    }
}
