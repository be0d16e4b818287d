use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::dataset::file_stats;
use crate::errors::*;
use crate::graph::{Job, JobState};
use crate::index::*;
use crate::jobs::store::PipelineStore;
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Success,
    Fail,
}

impl JobEvent {
    pub fn state(&self) -> JobState {
        match self {
            JobEvent::Start => JobState::Running,
            JobEvent::Success => JobState::Done,
            JobEvent::Fail => JobState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::Start => "start",
            JobEvent::Success => "success",
            JobEvent::Fail => "fail",
        }
    }
}

/// Hooks called around the execution of a job.
pub trait JobListener {
    fn name(&self) -> &'static str;

    fn on_start(&mut self, _job: &Job) -> Result<()> {
        Ok(())
    }

    fn on_success(&mut self, _job: &Job) -> Result<()> {
        Ok(())
    }

    fn on_fail(&mut self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

/// Listeners of one run. Errors raised by a listener are logged and dropped.
#[derive(Default)]
pub struct Listeners {
    listeners: Vec<Box<dyn JobListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: impl JobListener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn notify(&mut self, event: JobEvent, job: &Job) {
        for l in &mut self.listeners {
            let res = match event {
                JobEvent::Start => l.on_start(job),
                JobEvent::Success => l.on_success(job),
                JobEvent::Fail => l.on_fail(job),
            };
            if let Err(e) = res {
                tracing::warn!(listener = l.name(), job = %job.name, ?event, "listener failed: {e}");
            }
        }
    }
}

/// Records job states in the [`PipelineStore`] of the job's pipeline.
pub struct StoreListener {
    project: PathBuf,
    default_store: String,
}

impl StoreListener {
    const NAME: &'static str = "StoreListener";

    pub fn new(project: impl Into<PathBuf>, default_store: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            default_store: default_store.into(),
        }
    }

    fn update(&self, job: &Job, state: JobState) -> Result<()> {
        let name = job.pipeline.as_deref().unwrap_or(&self.default_store);
        PipelineStore::new(&self.project, name).update_state(&job.name, state)?;
        Ok(())
    }
}

impl JobListener for StoreListener {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_start(&mut self, job: &Job) -> Result<()> {
        self.update(job, JobState::Running)
    }

    fn on_success(&mut self, job: &Job) -> Result<()> {
        self.update(job, JobState::Done)
    }

    fn on_fail(&mut self, job: &Job) -> Result<()> {
        self.update(job, JobState::Failed)
    }
}

/// Adds the outputs of successful dataset jobs to the project index.
pub struct IndexListener {
    index: PathBuf,
    format: IndexFormat,
    compute_stats: bool,
    views: BTreeMap<String, String>,
}

impl IndexListener {
    const NAME: &'static str = "IndexListener";

    pub fn new(index: impl Into<PathBuf>, format: IndexFormat) -> Self {
        Self {
            index: index.into(),
            format,
            compute_stats: false,
            views: BTreeMap::new(),
        }
    }

    pub fn compute_stats(mut self, compute_stats: bool) -> Self {
        self.compute_stats = compute_stats;
        self
    }

    /// Tag files of output `param` with `view`.
    pub fn view(mut self, param: impl Into<String>, view: impl Into<String>) -> Self {
        self.views.insert(param.into(), view.into());
        self
    }

    /// Index fields for an output file: the id is the file name without
    /// `.gz`, its extension and a `.bam` infix.
    fn fields(&self, param: &str, path: &Path) -> Result<Option<Metadata>> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let name = file_name.strip_suffix(".gz").unwrap_or(file_name);
        let Some((base, ext)) = name.rsplit_once('.') else {
            return Ok(None);
        };
        let id = base.replace(".bam", "");

        let mut fields = Metadata::new();
        fields.set(self.format.id.as_str(), id)?;
        fields.set("path", path.display().to_string())?;
        fields.set("type", ext)?;
        if self.compute_stats {
            let (md5, size) = file_stats(path)?;
            fields.set("size", size.to_string())?;
            fields.set("md5", md5)?;
        }
        if let Some(view) = self.views.get(param) {
            fields.set("view", view.as_str())?;
        }
        Ok(Some(fields))
    }
}

impl JobListener for IndexListener {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_success(&mut self, job: &Job) -> Result<()> {
        if job.kind.is_setup() {
            return Ok(());
        }

        let mut index = Index::with_format(Some(self.index.clone()), self.format.clone());
        index.lock()?;
        index.open()?;

        for (param, output) in &job.outputs {
            let path = Path::new(output);
            if !path.exists() {
                continue;
            }
            let Some(fields) = self.fields(param, path)? else {
                continue;
            };
            if let Err(e) = index.insert(&fields, true) {
                tracing::warn!(job = %job.name, file = %output, "not indexed: {e}");
            }
        }

        index.save()?;
        index.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ToolKind;
    use crate::jobs::store::*;

    struct Failing;

    impl JobListener for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn on_start(&mut self, _job: &Job) -> Result<()> {
            Err(Error::Execution {
                job: "x".to_owned(),
                reason: "boom".to_owned(),
            })
        }
    }

    #[test]
    fn listener_errors_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PipelineStore::new(dir.path(), "p");
        store.set("gem.a", StoreEntry::queued()).unwrap();

        let mut job = Job::new("gem.a", "gem", ToolKind::Aligner);
        job.pipeline = Some("p".to_owned());

        let mut listeners = Listeners::new();
        listeners
            .add(Failing)
            .add(StoreListener::new(dir.path(), "p"));
        listeners.notify(JobEvent::Start, &job);

        assert_eq!(store.get().unwrap().jobs["gem.a"].state, JobState::Running);
        assert!(!store.is_locked());
    }

    #[test]
    fn outputs_are_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let bam = dir.path().join("a.bam");
        let bai = dir.path().join("a.bam.bai");
        std::fs::write(&bam, "bam").unwrap();
        std::fs::write(&bai, "bai").unwrap();

        let mut job = Job::new("gem.a", "gem", ToolKind::Aligner);
        job.outputs.insert("bam".to_owned(), bam.display().to_string());
        job.outputs.insert("bai".to_owned(), bai.display().to_string());
        job.outputs.insert("map".to_owned(), dir.path().join("a.map.gz").display().to_string());

        let index_path = dir.path().join(".index");
        let mut l = IndexListener::new(&index_path, IndexFormat::default())
            .compute_stats(true)
            .view("bam", "Alignments");
        l.on_success(&job).unwrap();

        let mut index = Index::new(Some(index_path));
        index.open().unwrap();
        let d = index.get("a").unwrap();
        let bams = d.files(&crate::dataset::FileType::Bam);
        assert_eq!(bams.len(), 1);
        assert_eq!(bams[0].view(), Some("Alignments"));
        assert_eq!(bams[0].size(), Some("3"));
        assert_eq!(d.files(&crate::dataset::FileType::Bai).len(), 1);
    }
}
