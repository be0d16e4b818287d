use crate::config::JobConfig;
use crate::graph::*;

pub struct GemIndexTool {
    input: String,
    output: Option<String>,
    no_hash: bool,
}

impl GemIndexTool {
    const NAME: &'static str = "gem_index";

    /// Build the GEM index of a genome fasta file.
    ///
    /// The index is written next to the genome as `<genome without ext>.gem`
    /// unless an explicit output is given.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: None,
            no_hash: false,
        }
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn no_hash(mut self, no_hash: bool) -> Self {
        self.no_hash = no_hash;
        self
    }

    pub fn index(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("{}.gem", strip_ext(&self.input)))
    }
}

impl Tool for GemIndexTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Indexer
    }

    fn job_name(&self) -> String {
        format!("index.{}", stem(&self.input))
    }

    fn inputs(&self) -> FileParams {
        params([("input", self.input.as_str())])
    }

    fn outputs(&self) -> FileParams {
        params([("output", self.index().as_str())])
    }

    fn command(&self, config: &JobConfig) -> String {
        CommandLine::new("gemtools index")
            .opt("-i", &self.input)
            .opt("-o", self.index())
            .flag("--no-hash", self.no_hash)
            .threads(config)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_next_to_genome() {
        let t = GemIndexTool::new("/refs/genome.fa");
        assert_eq!(t.job_name(), "index.genome");
        assert_eq!(t.index(), "/refs/genome.gem");
        assert_eq!(t.outputs()["output"], "/refs/genome.gem");

        let job = t.to_job(JobConfig::default());
        assert_eq!(job.kind, ToolKind::Indexer);
        assert_eq!(job.command, "gemtools index -i /refs/genome.fa -o /refs/genome.gem -t 1");
    }
}
