//! Tool nodes that expand into jobs.

use std::path::Path;

use crate::config::JobConfig;
use crate::graph::*;

mod gem_index_tool;
pub use gem_index_tool::*;

mod gem_t_index_tool;
pub use gem_t_index_tool::*;

mod gem_tool;
pub use gem_tool::*;

mod flux_tool;
pub use flux_tool::*;

pub trait Tool {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ToolKind;

    fn job_name(&self) -> String;

    fn inputs(&self) -> FileParams;

    fn outputs(&self) -> FileParams;

    fn command(&self, config: &JobConfig) -> String;

    fn to_job(&self, config: JobConfig) -> Job {
        let mut job = Job::new(self.job_name(), self.name(), self.kind());
        job.inputs = self.inputs();
        job.outputs = self.outputs();
        job.command = self.command(&config);
        job.config = config;
        job
    }
}

/// `path` without its last extension.
pub(crate) fn strip_ext(path: &str) -> String {
    let p = Path::new(path);
    match p.extension() {
        Some(_) => p.with_extension("").display().to_string(),
        None => path.to_owned(),
    }
}

/// File name of `path` without its last extension.
pub(crate) fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

pub(crate) fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> FileParams {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

/// Shell command assembled from a program and its arguments.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandLine {
    parts: Vec<String>,
}

impl CommandLine {
    pub fn new(program: &str) -> Self {
        Self {
            parts: program.split_whitespace().map(str::to_owned).collect(),
        }
    }

    pub fn opt(mut self, flag: &str, value: impl AsRef<str>) -> Self {
        self.parts.push(flag.to_owned());
        self.parts.push(quote(value.as_ref()));
        self
    }

    pub fn opt_if(self, flag: &str, value: Option<impl AsRef<str>>) -> Self {
        match value {
            Some(v) => self.opt(flag, v),
            None => self,
        }
    }

    pub fn flag(mut self, flag: &str, set: bool) -> Self {
        if set {
            self.parts.push(flag.to_owned());
        }
        self
    }

    pub fn threads(self, config: &JobConfig) -> Self {
        self.opt("-t", config.threads.unwrap_or(1).to_string())
    }

    pub fn build(self) -> String {
        self.parts.join(" ")
    }
}

/// Single quote `arg` unless it only holds shell safe characters.
pub(crate) fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+,:=@%".contains(c));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(strip_ext("genomes/genome.fa"), "genomes/genome");
        assert_eq!(strip_ext("genome"), "genome");
        assert_eq!(stem("/data/genomes/genome.fa"), "genome");
        assert_eq!(stem("genome.gem"), "genome");
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("/data/a_1.fastq.gz"), "/data/a_1.fastq.gz");
        assert_eq!(quote("my file"), "'my file'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn command_line() {
        let cfg = JobConfig {
            threads: Some(4),
            ..Default::default()
        };
        let cmd = CommandLine::new("gemtools index")
            .opt("-i", "g.fa")
            .opt_if("-o", None::<&str>)
            .flag("--no-hash", true)
            .threads(&cfg)
            .build();
        assert_eq!(cmd, "gemtools index -i g.fa --no-hash -t 4");
    }
}
