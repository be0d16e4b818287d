use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use grape::{FolderLayout, JobConfig, JobEvent};

#[derive(Parser, Debug)]
#[command(name = "grape", about = "Manage and run RNA-seq pipelines on grape projects", version)]
pub struct Args {
    /// Only log warnings and errors
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a new project
    Init {
        /// Project folder, the current directory by default
        path: Option<PathBuf>,

        /// Do not create the data, genomes and annotations folders
        #[arg(long)]
        no_structure: bool,

        /// Sub-folder layout of the data folder
        #[arg(long, value_enum)]
        folders: Option<Folders>,
    },

    /// Add new fastq files of a folder to the index
    Scan {
        /// Folder to scan, the project fastq folder by default
        path: Option<PathBuf>,

        /// Dataset id, numbered when several datasets are found
        #[arg(long)]
        id: Option<String>,

        /// Quality offset of the reads
        #[arg(long)]
        quality: Option<String>,

        /// Sex of the sample
        #[arg(long)]
        sex: Option<String>,

        /// Read type, e.g. "2x76D"
        #[arg(long)]
        read_type: Option<String>,

        #[command(flatten)]
        add: AddOptions,
    },

    /// Import an index or a tab or comma separated metadata file
    Import {
        input: PathBuf,

        /// Index format, a JSON string or file
        #[arg(long)]
        format: Option<String>,

        /// Compute md5 and size of imported fastq files
        #[arg(long)]
        compute_stats: bool,
    },

    /// Write the project index
    Export {
        /// Output file, stdout by default
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write absolute file paths
        #[arg(long)]
        absolute_path: bool,

        #[command(flatten)]
        select: Selection,
    },

    /// List datasets and their files
    List {
        /// Print the files as JSON objects
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        select: Selection,
    },

    /// Show or modify the project configuration
    Config {
        /// Print the configuration
        #[arg(long)]
        show: bool,

        /// Set a key, e.g. `--set genome genomes/genome.fa`
        #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"])]
        set: Option<Vec<String>>,

        /// Remove a key
        #[arg(long, value_name = "KEY")]
        remove: Option<String>,

        /// Include hidden keys
        #[arg(long)]
        hidden: bool,

        /// Include empty values
        #[arg(long)]
        empty: bool,
    },

    /// Run the default pipeline locally
    Run {
        /// Print the jobs instead of running them
        #[arg(long)]
        dry: bool,

        /// Run jobs that are already done
        #[arg(long)]
        force: bool,

        /// Pass --verbose to the tools
        #[arg(long)]
        verbose: bool,

        /// Compute md5 and size of the indexed results
        #[arg(long)]
        compute_stats: bool,

        #[command(flatten)]
        select: Selection,

        #[command(flatten)]
        job: JobOptions,
    },

    /// Submit the default pipeline to the cluster
    Submit {
        /// Print the jobs instead of submitting them
        #[arg(long)]
        dry: bool,

        /// Store the jobs without submitting them
        #[arg(long)]
        hold: bool,

        /// Submit jobs that are already done
        #[arg(long)]
        force: bool,

        /// Compute md5 and size of the indexed results
        #[arg(long)]
        compute_stats: bool,

        #[command(flatten)]
        select: Selection,

        #[command(flatten)]
        job: JobOptions,
    },

    /// Show the state of submitted jobs
    Jobs,

    /// Report the state of a submitted job, called by job scripts
    #[command(hide = true)]
    JobState {
        /// Project folder
        #[arg(long)]
        project: PathBuf,

        /// Compute md5 and size of the indexed results
        #[arg(long)]
        compute_stats: bool,

        /// Job database id
        record: u64,

        #[arg(value_enum)]
        event: Event,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Event {
    Start,
    Success,
    Fail,
}

impl From<Event> for JobEvent {
    fn from(e: Event) -> Self {
        match e {
            Event::Start => JobEvent::Start,
            Event::Success => JobEvent::Success,
            Event::Fail => JobEvent::Fail,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Folders {
    Type,
    Dataset,
}

impl From<Folders> for FolderLayout {
    fn from(f: Folders) -> Self {
        match f {
            Folders::Type => FolderLayout::Type,
            Folders::Dataset => FolderLayout::Dataset,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct AddOptions {
    /// Compute md5 and size of the files
    #[arg(long)]
    pub compute_stats: bool,

    /// Overwrite existing dataset tags
    #[arg(long)]
    pub update: bool,

    /// Store absolute file paths
    #[arg(long)]
    pub absolute_path: bool,
}

#[derive(ClapArgs, Debug)]
pub struct Selection {
    /// Dataset ids, all datasets by default
    #[arg(value_name = "DATASET")]
    pub datasets: Vec<String>,

    /// Only datasets with `key=value`
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,
}

impl Selection {
    pub fn filters(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.filters
            .iter()
            .map(|f| {
                f.split_once('=')
                    .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                    .ok_or_else(|| anyhow::anyhow!("invalid filter \"{f}\", expected key=value"))
            })
            .collect()
    }
}

#[derive(ClapArgs, Debug)]
pub struct JobOptions {
    /// Number of cpus per job
    #[arg(short = 'c', long = "cpus")]
    pub threads: Option<u32>,

    /// Maximum wall clock time
    #[arg(short = 't', long = "time")]
    pub max_time: Option<String>,

    /// Cluster queue
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Job priority
    #[arg(short, long)]
    pub priority: Option<String>,

    /// Maximum memory
    #[arg(short = 'm', long)]
    pub max_mem: Option<String>,
}

impl JobOptions {
    pub fn to_config(&self, verbose: bool) -> JobConfig {
        JobConfig {
            threads: self.threads,
            max_time: self.max_time.clone(),
            max_mem: self.max_mem.clone(),
            queue: self.queue.clone(),
            priority: self.priority.clone(),
            verbose: verbose.then_some(true),
            modules: Vec::new(),
        }
    }
}
