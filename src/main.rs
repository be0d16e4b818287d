mod cli;

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use cli::{Args, Command, JobOptions, Selection};
use grape::*;

const DEFAULT_STORE: &str = "default";

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.quiet {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", format!("{e:#}").red());
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Init {
            path,
            no_structure,
            folders,
        } => {
            let path = match path {
                Some(p) => p,
                None => std::env::current_dir()?,
            };
            let layout = folders.map(FolderLayout::from).unwrap_or_default();
            let project = Project::init(&path, !no_structure, layout)?;
            println!("{}", format!("Project initialized in {}", project.path().display()).green());
        }

        Command::Scan {
            path,
            id,
            quality,
            sex,
            read_type,
            add,
        } => {
            let mut project = open_project()?;
            let mut fields = Metadata::new();
            for (k, v) in [("quality", quality), ("sex", sex), ("readType", read_type)] {
                if let Some(v) = v {
                    fields.set(k, v)?;
                }
            }

            let dir = path.unwrap_or_else(|| project.folder("fastq", None));
            println!("{}", format!("Scanning {}", dir.display()).yellow());
            let summary = project.scan(
                Some(&dir),
                &fields,
                id.as_deref(),
                add.compute_stats,
                add.update,
                add.absolute_path,
            )?;
            println!("{} fastq files found, {} new", summary.found, summary.new);
            for d in &summary.datasets {
                println!("{}", format!("Added dataset {d}").green());
            }
        }

        Command::Import {
            input,
            format,
            compute_stats,
        } => {
            let mut project = open_project()?;
            let format = format.map(|f| IndexFormat::parse(&f)).transpose()?;
            let before = project.index().len();
            project
                .import(&input, format, compute_stats)
                .with_context(|| format!("unable to import {}", input.display()))?;
            let added = project.index().len().saturating_sub(before);
            println!("{}", format!("Imported {}, {added} new datasets", input.display()).green());
        }

        Command::Export {
            output,
            absolute_path,
            select,
        } => {
            let project = open_project()?;
            let selected = selection(&project, &select)?;
            match output {
                Some(path) => {
                    let file = File::create(&path).with_context(|| format!("unable to create {}", path.display()))?;
                    selected.export(&mut BufWriter::new(file), absolute_path)?;
                }
                None => selected.export(&mut io::stdout().lock(), absolute_path)?,
            }
        }

        Command::List { json, select } => {
            let project = open_project()?;
            let selected = selection(&project, &select)?;
            if json {
                for line in selected.export_json(false) {
                    println!("{line}");
                }
            } else {
                list_datasets(&selected);
            }
        }

        Command::Config {
            show,
            set,
            remove,
            hidden,
            empty,
        } => {
            let mut project = open_project()?;
            if let Some([key, value]) = set.as_deref() {
                let value = if Path::new(value).is_file() {
                    project.link_reference(Path::new(value))?.unwrap_or_else(|| value.clone())
                } else {
                    value.clone()
                };
                project.config_mut().set(key, &value);
                project.config().save()?;
            }
            if let Some(key) = remove {
                if project.config_mut().remove(&key).is_none() {
                    bail!("no configuration entry for \"{key}\"");
                }
                project.config().save()?;
            }
            if show {
                for (k, v) in project.config().values(None, &[], hidden, empty) {
                    println!("{}\t{v}", k.bold());
                }
            }
        }

        Command::Run {
            dry,
            force,
            verbose,
            compute_stats,
            select,
            job,
        } => {
            let project = open_project()?;
            let (mut graph, order) = build_jobs(&project, &select, &job, verbose)?;
            if order.is_empty() {
                println!("{}", "No jobs to run".yellow());
                return Ok(());
            }
            if dry {
                show_dry(&graph, &order)?;
                return Ok(());
            }

            let mut db = JsonJobDatabase::new(project.job_db_path());
            save_jobs(&mut db, &mut graph, &order)?;
            register_jobs(&graph, &order, project.path(), force)?;
            create_output_dirs(&graph, &order)?;

            let mut listeners = Listeners::new();
            listeners
                .add(StoreListener::new(project.path(), DEFAULT_STORE))
                .add(index_listener(&project, compute_stats));

            let res = run_jobs(
                &mut graph,
                &order,
                &runtime_environment(),
                &mut listeners,
                force,
                Some(&project.log_dir()),
            );

            for &id in &order {
                let job = graph.job(id)?;
                if let Some(record) = job.record {
                    db.update_state(record, job.state)?;
                }
            }

            let summary = res?;
            println!(
                "{}",
                format!("{} jobs run, {} skipped", summary.ran.len(), summary.skipped.len()).green()
            );
        }

        Command::Submit {
            dry,
            hold,
            force,
            compute_stats,
            select,
            job,
        } => {
            let project = open_project()?;
            let (mut graph, order) = build_jobs(&project, &select, &job, false)?;
            if order.is_empty() {
                println!("{}", "No jobs to submit".yellow());
                return Ok(());
            }
            if dry {
                show_dry(&graph, &order)?;
                return Ok(());
            }

            let mut db = JsonJobDatabase::new(project.job_db_path());
            if hold {
                save_jobs(&mut db, &mut graph, &order)?;
                register_jobs(&graph, &order, project.path(), force)?;
                println!("{}", "Jobs stored and put on hold".yellow());
                return Ok(());
            }

            create_output_dirs(&graph, &order)?;
            let callback = StateCallback::new(std::env::current_exe()?, project.path()).compute_stats(compute_stats);
            let mut cluster =
                CommandCluster::new(GrapeHome::from_env().cluster_config()?, project.log_dir()).with_callback(callback);
            let submitted = submit_jobs(
                &mut graph,
                &order,
                &mut db,
                &mut cluster,
                &runtime_environment(),
                project.path(),
                force,
            )?;
            println!("{}", format!("{} jobs submitted", submitted.len()).green());
        }

        Command::Jobs => {
            let project = open_project()?;
            for store in PipelineStore::list(project.path())? {
                let data = store.get()?;
                println!("{}", data.name.bold());
                for (job, entry) in &data.jobs {
                    let state = format!("{:<8}", entry.state.as_str());
                    let state = match entry.state {
                        JobState::Done => state.green(),
                        JobState::Failed => state.red(),
                        _ => state.yellow(),
                    };
                    println!("  {job:<30} {state} {}", entry.id.as_deref().unwrap_or("-"));
                }
            }
        }

        Command::JobState {
            project,
            compute_stats,
            record,
            event,
        } => {
            let project = Project::open(project)?;
            std::env::set_current_dir(project.path())?;
            let mut db = JsonJobDatabase::new(project.job_db_path());
            let mut listeners = Listeners::new();
            listeners
                .add(StoreListener::new(project.path(), DEFAULT_STORE))
                .add(index_listener(&project, compute_stats));
            report_job_state(&mut db, record, event.into(), &mut listeners)?;
        }
    }

    Ok(())
}

fn open_project() -> Result<Project> {
    let cwd = std::env::current_dir()?;
    let Some(path) = Project::find(&cwd) else {
        bail!("No grape project found in {} or its parents", cwd.display());
    };
    Ok(Project::open(path)?)
}

fn selection(project: &Project, select: &Selection) -> Result<Index> {
    for id in &select.datasets {
        if project.index().get(id).is_none() {
            bail!(Error::DatasetNotFound(id.clone()));
        }
    }
    let mut selected = project.index().select(&select.datasets, &select.filters()?);
    selected.set_path(Some(project.index_path()));
    Ok(selected)
}

fn list_datasets(index: &Index) {
    println!("{}", format!("{:<20} {:<8} {:<16} Path", "Dataset", "Type", "View").bold());
    for d in index.datasets() {
        if d.num_files() == 0 {
            println!("{:<20} {:<8} {:<16} -", d.id(), "-", "-");
        }
        for f in d.all_files() {
            println!(
                "{:<20} {:<8} {:<16} {}",
                d.id(),
                f.file_type().as_str(),
                f.view().unwrap_or("-"),
                f.path()
            );
        }
    }
}

/// Create the default pipelines of the selected datasets and resolve them
/// against previously stored jobs. Paths are relative to the project, which
/// becomes the working directory.
fn build_jobs(
    project: &Project,
    select: &Selection,
    options: &JobOptions,
    verbose: bool,
) -> Result<(JobGraph, Vec<JobId>)> {
    std::env::set_current_dir(project.path())?;

    let datasets = project.get_datasets(&select.datasets, &select.filters()?)?;
    if datasets.is_empty() {
        bail!("No datasets selected");
    }
    let pipelines = datasets
        .iter()
        .map(|d| default_pipeline(d, project.config()))
        .collect::<grape::Result<Vec<_>>>()?;

    let home = GrapeHome::from_env();
    let overrides = options.to_config(verbose);
    let mut graph = create_jobs(&pipelines, |tool| home.job_config(tool.name(), Some(&overrides)))?;

    let ids = graph.ids().collect::<Vec<_>>();
    let mut db = JsonJobDatabase::new(project.job_db_path());
    let keep = check_jobs_dependencies(&mut graph, &ids, &mut db)?;
    let order = graph.topological_order(&keep)?;
    Ok((graph, order))
}

fn create_output_dirs(graph: &JobGraph, order: &[JobId]) -> Result<()> {
    for &id in order {
        for output in graph.job(id)?.outputs.values() {
            if let Some(parent) = Path::new(output).parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("unable to create {}", parent.display()))?;
            }
        }
    }
    Ok(())
}

fn index_listener(project: &Project, compute_stats: bool) -> IndexListener {
    IndexListener::new(project.index_path(), project.index().format().clone())
        .compute_stats(compute_stats)
        .view("map", "GemMapping")
        .view("bam", "Alignments")
        .view("bai", "AlignmentsIndex")
        .view("output", "TranscriptQuantifications")
}

/// Binaries in `$GRAPE_HOME/bin` come before the ones on `PATH`.
fn runtime_environment() -> RuntimeEnvironment {
    let dirs = std::env::var_os("GRAPE_HOME")
        .map(|h| vec![PathBuf::from(h).join("bin")])
        .unwrap_or_default();
    RuntimeEnvironment::new(dirs)
}
