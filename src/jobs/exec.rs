use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use colored::Colorize;

use crate::config::ClusterConfig;
use crate::errors::*;
use crate::graph::*;
use crate::jobs::listeners::*;
use crate::jobs::store::*;

/// Environment a tool runs in: binary directories prepended to `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    binary_directories: Vec<PathBuf>,
}

impl RuntimeEnvironment {
    pub fn new(binary_directories: Vec<PathBuf>) -> Self {
        Self { binary_directories }
    }

    pub fn binary_directories(&self) -> &[PathBuf] {
        &self.binary_directories
    }

    /// This environment extended with the modules configured for `job`.
    pub fn for_job(&self, job: &Job) -> Self {
        let mut res = self.clone();
        for m in &job.config.modules {
            if !res.binary_directories.contains(m) {
                res.binary_directories.push(m.clone());
            }
        }
        res
    }

    /// `PATH` with the binary directories in front.
    pub fn path(&self) -> Result<OsString> {
        let current = env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .binary_directories
            .iter()
            .cloned()
            .chain(env::split_paths(&current));
        env::join_paths(dirs).map_err(|e| Error::Execution {
            job: String::new(),
            reason: format!("invalid PATH entry: {e}"),
        })
    }

    pub fn apply(&self, cmd: &mut Command) -> Result<()> {
        if !self.binary_directories.is_empty() {
            cmd.env("PATH", self.path()?);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ran: Vec<JobId>,
    pub skipped: Vec<JobId>,
}

fn log_files(log_dir: &Path, job: &Job) -> (PathBuf, PathBuf) {
    (
        log_dir.join(format!("{}.out", job.name)),
        log_dir.join(format!("{}.err", job.name)),
    )
}

fn run_one(job: &Job, env: &RuntimeEnvironment, log_dir: Option<&Path>) -> Result<bool> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&job.command);
    env.for_job(job).apply(&mut cmd)?;

    if let Some(dir) = log_dir {
        fs::create_dir_all(dir).map_err(|e| Error::file_io(dir, e))?;
        let (out, err) = log_files(dir, job);
        cmd.stdout(Stdio::from(File::create(&out).map_err(|e| Error::file_io(&out, e))?));
        cmd.stderr(Stdio::from(File::create(&err).map_err(|e| Error::file_io(&err, e))?));
    }

    let status = cmd.status().map_err(|e| Error::Execution {
        job: job.name.clone(),
        reason: e.to_string(),
    })?;
    Ok(status.success())
}

/// Run `order` locally, one job after the other. DONE jobs are skipped
/// unless `force` is set. Stops at the first failing job.
pub fn run_jobs(
    graph: &mut JobGraph,
    order: &[JobId],
    env: &RuntimeEnvironment,
    listeners: &mut Listeners,
    force: bool,
    log_dir: Option<&Path>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    for id in graph.topological_order(order)? {
        let job = graph.job(id)?;
        if job.state == JobState::Done && !force {
            println!("{}", format!("Skipping {}", job.name).yellow());
            summary.skipped.push(id);
            continue;
        }

        println!("{}", format!("Running {:30}", job.name).yellow());
        graph.job_mut(id)?.state = JobState::Running;
        listeners.notify(JobEvent::Start, graph.job(id)?);

        let start = Instant::now();
        let res = run_one(graph.job(id)?, env, log_dir);
        let success = matches!(res, Ok(true));

        let state = if success { JobState::Done } else { JobState::Failed };
        graph.job_mut(id)?.state = state;
        let job = graph.job(id)?;

        if success {
            listeners.notify(JobEvent::Success, job);
            println!("{}", format!("{state} [{:.0?}]", start.elapsed()).green());
            summary.ran.push(id);
        } else {
            listeners.notify(JobEvent::Fail, job);
            println!("{}", state.to_string().red());
            return Err(match res {
                Err(e) => e,
                _ => Error::Execution {
                    job: job.name.clone(),
                    reason: "command exited with an error".to_owned(),
                },
            });
        }
    }

    Ok(summary)
}

/// Identifiers a scheduler returned for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub trait Cluster {
    /// Submit `job` so that it starts after the jobs with remote ids `dependencies`.
    fn submit(&mut self, job: &Job, dependencies: &[String], env: &RuntimeEnvironment) -> Result<Submission>;
}

/// Submits by running the configured command on a generated job script.
///
/// Arguments may use `{name}`, `{stdout}`, `{stderr}` and `{threads}`; the
/// dependency template is added when the job has dependencies and the
/// script path comes last.
pub struct CommandCluster {
    config: ClusterConfig,
    log_dir: PathBuf,
    callback: Option<StateCallback>,
}

/// The grape command a job script runs to report its state back to the
/// project, see [`report_job_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCallback {
    pub program: PathBuf,
    pub project: PathBuf,
    pub compute_stats: bool,
}

impl StateCallback {
    pub fn new(program: impl Into<PathBuf>, project: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            project: project.into(),
            compute_stats: false,
        }
    }

    pub fn compute_stats(mut self, compute_stats: bool) -> Self {
        self.compute_stats = compute_stats;
        self
    }

    /// Shell function `report <event>` for the job stored as `record`.
    fn shell_function(&self, record: u64) -> String {
        let stats = if self.compute_stats { " --compute-stats" } else { "" };
        format!(
            "report() {{ {} --quiet job-state --project {}{stats} {record} \"$1\" || true; }}\n",
            quote(&self.program.to_string_lossy()),
            quote(&self.project.to_string_lossy()),
        )
    }
}

impl CommandCluster {
    pub fn new(config: ClusterConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            log_dir: log_dir.into(),
            callback: None,
        }
    }

    /// Make job scripts report start, success and failure through `callback`.
    pub fn with_callback(mut self, callback: StateCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Job script for `job`. With a callback and a persisted job the command
    /// runs in a subshell of the project folder, wrapped in `report` calls.
    fn script(&self, job: &Job, env: &RuntimeEnvironment) -> Result<PathBuf> {
        let path = self.log_dir.join(format!("{}.sh", job.name));
        let mut path_line = String::new();
        if !env.binary_directories().is_empty() {
            let dirs = env::join_paths(env.binary_directories()).map_err(|e| Error::Submission {
                job: job.name.clone(),
                reason: e.to_string(),
            })?;
            path_line = format!("export PATH={}:$PATH\n", quote(&dirs.to_string_lossy()));
        }

        let mut text = String::from("#!/bin/sh\n");
        match (&self.callback, job.record) {
            (Some(callback), Some(record)) => {
                text.push_str(&format!("cd {} || exit 1\n", quote(&callback.project.to_string_lossy())));
                text.push_str(&callback.shell_function(record));
                text.push_str("trap 'report fail; exit 143' TERM INT\n");
                text.push_str("report start\n(\nset -e\n");
                text.push_str(&path_line);
                text.push_str(&job.command);
                text.push_str("\n)\nstatus=$?\n");
                text.push_str("if [ \"$status\" -eq 0 ]; then report success; else report fail; fi\n");
                text.push_str("exit \"$status\"\n");
            }
            _ => {
                text.push_str("set -e\n");
                text.push_str(&path_line);
                text.push_str(&job.command);
                text.push('\n');
            }
        }

        fs::create_dir_all(&self.log_dir).map_err(|e| Error::file_io(&self.log_dir, e))?;
        fs::write(&path, text).map_err(|e| Error::file_io(&path, e))?;
        Ok(path)
    }

    /// First all digit token of the scheduler output, or the whole output.
    fn parse_id(output: &str) -> Option<String> {
        output
            .split(|c: char| c.is_whitespace() || c == '.' || c == '"')
            .find(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_owned)
            .or_else(|| Some(output.trim().to_owned()).filter(|s| !s.is_empty()))
    }
}

impl Cluster for CommandCluster {
    fn submit(&mut self, job: &Job, dependencies: &[String], env: &RuntimeEnvironment) -> Result<Submission> {
        let failed = |reason: String| Error::Submission {
            job: job.name.clone(),
            reason,
        };

        let (program, args) = self
            .config
            .submit
            .split_first()
            .ok_or_else(|| failed("empty submit command".to_owned()))?;

        let env = env.for_job(job);
        let script = self.script(job, &env)?;
        let (stdout, stderr) = log_files(&self.log_dir, job);
        let threads = job.config.threads.unwrap_or(1).to_string();
        let fill = |arg: &str| {
            arg.replace("{name}", &job.name)
                .replace("{stdout}", &stdout.display().to_string())
                .replace("{stderr}", &stderr.display().to_string())
                .replace("{threads}", &threads)
        };

        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| fill(a)));
        if let (Some(template), false) = (&self.config.dependency, dependencies.is_empty()) {
            let ids = dependencies.join(&self.config.id_separator);
            cmd.args(template.replace("{ids}", &ids).split_whitespace());
        }
        cmd.arg(&script);

        let output = cmd.output().map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(utf8(&output.stderr).trim().to_owned()));
        }

        let job_id = Self::parse_id(&utf8(&output.stdout))
            .ok_or_else(|| failed("scheduler returned no job id".to_owned()))?;
        Ok(Submission { job_id, stdout, stderr })
    }
}

fn store_for(project: &Path, job: &Job) -> PipelineStore {
    PipelineStore::new(project, job.pipeline.as_deref().unwrap_or("default"))
}

fn submit_all(
    graph: &mut JobGraph,
    order: &[JobId],
    db: &mut dyn JobDatabase,
    cluster: &mut dyn Cluster,
    env: &RuntimeEnvironment,
    project: &Path,
    force: bool,
) -> Result<Vec<JobId>> {
    let mut submitted = Vec::new();

    for &id in order {
        let job = graph.job(id)?;
        if job.state == JobState::Done && !force {
            println!("{}", format!("Skipping {}", job.name).yellow());
            continue;
        }

        let mut store = store_for(project, job);
        store.locked(|s| s.set(&job.name, StoreEntry::queued()))?;

        let dependencies = job
            .dependencies
            .iter()
            .filter_map(|d| graph.get(*d))
            .filter(|d| d.state != JobState::Done)
            .filter_map(|d| d.remote_id.clone())
            .collect::<Vec<_>>();
        let sub = cluster.submit(job, &dependencies, env)?;

        store.locked(|s| s.set_submission(&job.name, &sub.job_id, &sub.stdout, &sub.stderr))?;

        // the job may have reported a state already, keep the stored one
        let mut state = JobState::Queued;
        if let Some(record) = job.record {
            if let Some(mut p) = db.get(record)? {
                p.remote_id = Some(sub.job_id.clone());
                p.stdout = Some(sub.stdout.clone());
                p.stderr = Some(sub.stderr.clone());
                state = p.state;
                db.save_job(p)?;
            }
        }

        println!("{}", format!("Submitted {} with remote id {}", job.name, sub.job_id).green());
        let job = graph.job_mut(id)?;
        job.remote_id = Some(sub.job_id);
        job.state = state;
        submitted.push(id);
    }

    Ok(submitted)
}

/// Persist `ids` in `db` and submit them in dependency order. Every job gets
/// a QUEUED store entry before it is handed to the cluster. On failure the
/// persisted jobs are deleted again and the error is returned.
pub fn submit_jobs(
    graph: &mut JobGraph,
    ids: &[JobId],
    db: &mut dyn JobDatabase,
    cluster: &mut dyn Cluster,
    env: &RuntimeEnvironment,
    project: &Path,
    force: bool,
) -> Result<Vec<JobId>> {
    let order = graph.topological_order(ids)?;
    save_jobs(db, graph, &order)?;

    match submit_all(graph, &order, db, cluster, env, project, force) {
        Ok(submitted) => Ok(submitted),
        Err(e) => {
            tracing::error!("submission failed, removing jobs: {e}");
            delete_jobs(db, graph, &order)?;
            Err(e)
        }
    }
}

/// Apply `event` reported by the job stored as `record`. The job database
/// gets the new state and `listeners` are notified the way [`run_jobs`]
/// notifies them. Transitions out of DONE or FAILED are ignored. Returns the
/// stored state.
pub fn report_job_state(
    db: &mut dyn JobDatabase,
    record: u64,
    event: JobEvent,
    listeners: &mut Listeners,
) -> Result<JobState> {
    let persisted = db.get(record)?.ok_or_else(|| Error::Store {
        store: "jobs".to_owned(),
        reason: format!("no job with id {record}"),
    })?;

    let state = event.state();
    if !persisted.state.can_transition_to(state) {
        tracing::warn!(job = %persisted.name, record, "ignoring state change {} -> {state}", persisted.state);
        return Ok(persisted.state);
    }

    db.update_state(record, state)?;
    let mut job = persisted.to_job();
    job.state = state;
    listeners.notify(event, &job);
    Ok(state)
}

/// Give the jobs of `order` a QUEUED store entry before they run. Jobs that
/// are DONE and not forced keep their entry, or get a DONE one if they have
/// none. Returns the jobs that were queued.
pub fn register_jobs(graph: &JobGraph, order: &[JobId], project: &Path, force: bool) -> Result<Vec<JobId>> {
    let mut queued = Vec::new();
    for &id in order {
        let job = graph.job(id)?;
        let mut store = store_for(project, job);
        if job.state == JobState::Done && !force {
            store.locked(|s| {
                if s.get()?.jobs.contains_key(&job.name) {
                    return Ok(());
                }
                let entry = StoreEntry {
                    state: JobState::Done,
                    ..StoreEntry::queued()
                };
                s.set(&job.name, entry)
            })?;
            continue;
        }
        store.locked(|s| s.set(&job.name, StoreEntry::queued()))?;
        queued.push(id);
    }
    Ok(queued)
}

/// Print jobs with state and dependencies, then their commands.
pub fn show_dry(graph: &JobGraph, order: &[JobId]) -> Result<()> {
    println!("{}", format!("{:<30} {:<8} Dependencies", "Job", "State").bold());
    for &id in order {
        let job = graph.job(id)?;
        let deps = job
            .dependencies
            .iter()
            .filter_map(|d| graph.get(*d))
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<30} {:<8} {deps}", job.name, job.state.as_str());
    }

    println!();
    for &id in order {
        let job = graph.job(id)?;
        println!("{}", format!("# {}", job.name).blue());
        println!("{}", job.command);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, command: &str) -> Job {
        let mut j = Job::new(name, "test", ToolKind::Aligner);
        j.command = command.to_owned();
        j
    }

    #[test]
    fn path_prepends_directories() {
        let env = RuntimeEnvironment::new(vec![PathBuf::from("/opt/gem/bin")]);
        let path = env.path().unwrap();
        let first = env::split_paths(&path).next().unwrap();
        assert_eq!(first, PathBuf::from("/opt/gem/bin"));

        let mut j = job("a", "true");
        j.config.modules.push(PathBuf::from("/opt/flux/bin"));
        assert_eq!(env.for_job(&j).binary_directories().len(), 2);
    }

    #[test]
    fn run_stops_at_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = JobGraph::new();
        let a = g.add(job("a", "echo ok"));
        let b = g.add(job("b", "exit 3"));
        let c = g.add(job("c", "true"));
        g.add_edge(a, b).unwrap();
        g.add_edge(b, c).unwrap();

        let mut listeners = Listeners::new();
        let res = run_jobs(
            &mut g,
            &[a, b, c],
            &RuntimeEnvironment::default(),
            &mut listeners,
            false,
            Some(dir.path()),
        );
        assert!(matches!(res, Err(Error::Execution { .. })));
        assert_eq!(g.job(a).unwrap().state, JobState::Done);
        assert_eq!(g.job(b).unwrap().state, JobState::Failed);
        assert_eq!(g.job(c).unwrap().state, JobState::Queued);
        assert_eq!(fs::read_to_string(dir.path().join("a.out")).unwrap(), "ok\n");
    }

    #[test]
    fn done_jobs_are_skipped() {
        let mut g = JobGraph::new();
        let mut done = job("a", "exit 1");
        done.state = JobState::Done;
        let a = g.add(done);

        let summary = run_jobs(
            &mut g,
            &[a],
            &RuntimeEnvironment::default(),
            &mut Listeners::new(),
            false,
            None,
        )
        .unwrap();
        assert_eq!(summary.skipped, vec![a]);
    }

    #[test]
    fn script_reports_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig {
            submit: vec!["true".to_owned()],
            dependency: None,
            id_separator: ":".to_owned(),
        };
        let mut cluster = CommandCluster::new(config, dir.path());

        let mut j = job("index.genome", "gemtools index -i genome.fa");
        let plain = fs::read_to_string(cluster.script(&j, &RuntimeEnvironment::default()).unwrap()).unwrap();
        assert_eq!(plain, "#!/bin/sh\nset -e\ngemtools index -i genome.fa\n");

        cluster = cluster.with_callback(StateCallback::new("/opt/grape/bin/grape", "/projects/p1"));
        // not persisted, nothing to report to
        let plain_again = fs::read_to_string(cluster.script(&j, &RuntimeEnvironment::default()).unwrap()).unwrap();
        assert_eq!(plain_again, plain);

        j.record = Some(7);
        let text = fs::read_to_string(cluster.script(&j, &RuntimeEnvironment::default()).unwrap()).unwrap();
        assert!(text.contains("cd /projects/p1 || exit 1\n"));
        assert!(text.contains("/opt/grape/bin/grape --quiet job-state --project /projects/p1 7 \"$1\""));
        let start = text.find("report start").unwrap();
        let command = text.find("gemtools index").unwrap();
        let done = text.find("report success").unwrap();
        assert!(start < command && command < done);
        assert!(text.contains("else report fail; fi"));
    }

    #[test]
    fn reported_states_follow_the_lifecycle() {
        let mut db = MemoryJobDatabase::new();
        let record = db.save_job(PersistedJob::from_job(&job("gem.a", "true"))).unwrap();
        let mut listeners = Listeners::new();

        let state = report_job_state(&mut db, record, JobEvent::Start, &mut listeners).unwrap();
        assert_eq!(state, JobState::Running);
        let state = report_job_state(&mut db, record, JobEvent::Fail, &mut listeners).unwrap();
        assert_eq!(state, JobState::Failed);
        let state = report_job_state(&mut db, record, JobEvent::Success, &mut listeners).unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(db.get(record).unwrap().unwrap().state, JobState::Failed);

        assert!(matches!(
            report_job_state(&mut db, 99, JobEvent::Start, &mut listeners),
            Err(Error::Store { .. })
        ));
    }

    #[test]
    fn done_jobs_keep_their_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = JobGraph::new();
        let mut done = job("gem.a", "true");
        done.state = JobState::Done;
        done.pipeline = Some("test".to_owned());
        let mut failed = job("flux.a", "true");
        failed.pipeline = Some("test".to_owned());
        let a = g.add(done);
        let b = g.add(failed);

        let mut store = PipelineStore::new(dir.path(), "test");
        let entry = StoreEntry {
            id: Some("12".to_owned()),
            ..StoreEntry::queued()
        };
        store
            .locked(|s| s.set("flux.a", StoreEntry { state: JobState::Failed, ..entry }))
            .unwrap();

        assert_eq!(register_jobs(&g, &[a, b], dir.path(), false).unwrap(), vec![b]);
        let data = store.get().unwrap();
        assert_eq!(data.jobs["gem.a"].state, JobState::Done);
        assert_eq!(data.jobs["flux.a"].state, JobState::Queued);

        assert_eq!(register_jobs(&g, &[a, b], dir.path(), true).unwrap(), vec![a, b]);
        assert_eq!(store.get().unwrap().jobs["gem.a"].state, JobState::Queued);
    }

    #[test]
    fn scheduler_ids() {
        assert_eq!(
            CommandCluster::parse_id("Submitted batch job 4242\n").as_deref(),
            Some("4242")
        );
        assert_eq!(
            CommandCluster::parse_id("Your job 17 (\"gem.a\") has been submitted").as_deref(),
            Some("17")
        );
        assert_eq!(CommandCluster::parse_id("job-abc").as_deref(), Some("job-abc"));
        assert_eq!(CommandCluster::parse_id("  "), None);
    }
}
