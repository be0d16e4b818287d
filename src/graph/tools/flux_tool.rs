use std::path::Path;

use crate::config::JobConfig;
use crate::graph::*;

pub struct FluxTool {
    name: String,
    input: String,
    annotation: String,
    output_dir: Option<String>,
}

impl FluxTool {
    const NAME: &'static str = "flux";

    /// Quantify transcripts from a BAM file with the Flux Capacitor.
    /// Output goes to `<output_dir>/<name>.gtf`, next to the input by default.
    pub fn new(name: impl Into<String>, input: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            annotation: annotation.into(),
            output_dir: None,
        }
    }

    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(dir.as_ref().display().to_string());
        self
    }

    pub fn output(&self) -> String {
        let dir = match &self.output_dir {
            Some(d) => Path::new(d).to_path_buf(),
            None => Path::new(&self.input)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        dir.join(format!("{}.gtf", self.name)).display().to_string()
    }
}

impl Tool for FluxTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Quantifier
    }

    fn job_name(&self) -> String {
        format!("flux.{}", self.name)
    }

    fn inputs(&self) -> FileParams {
        params([("input", self.input.as_str()), ("annotation", self.annotation.as_str())])
    }

    fn outputs(&self) -> FileParams {
        params([("output", self.output().as_str())])
    }

    fn command(&self, _config: &JobConfig) -> String {
        CommandLine::new("flux-capacitor")
            .opt("-i", &self.input)
            .opt("-a", &self.annotation)
            .opt("-o", self.output())
            .build()
    }
}
