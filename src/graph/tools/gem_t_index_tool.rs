use crate::config::JobConfig;
use crate::graph::*;

pub const DEFAULT_MAX_READ_LENGTH: u32 = 150;

pub struct GemTranscriptomeIndexTool {
    index: String,
    annotation: String,
    output_prefix: Option<String>,
    max_length: u32,
}

impl GemTranscriptomeIndexTool {
    const NAME: &'static str = "gem_t_index";

    /// Build the transcriptome index from a genome index and a GTF
    /// annotation. Outputs default to `<annotation>.junctions.{gem,keys}`.
    pub fn new(index: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            annotation: annotation.into(),
            output_prefix: None,
            max_length: DEFAULT_MAX_READ_LENGTH,
        }
    }

    pub fn output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = Some(prefix.into());
        self
    }

    pub fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    fn prefix(&self) -> &str {
        self.output_prefix.as_deref().unwrap_or(&self.annotation)
    }

    pub fn transcript_index(&self) -> String {
        format!("{}.junctions.gem", self.prefix())
    }

    pub fn transcript_keys(&self) -> String {
        format!("{}.junctions.keys", self.prefix())
    }
}

impl Tool for GemTranscriptomeIndexTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> ToolKind {
        ToolKind::TranscriptomeIndexer
    }

    fn job_name(&self) -> String {
        format!("t_index.{}", stem(&self.index))
    }

    fn inputs(&self) -> FileParams {
        params([("index", self.index.as_str()), ("annotation", self.annotation.as_str())])
    }

    fn outputs(&self) -> FileParams {
        params([
            ("gem", self.transcript_index().as_str()),
            ("keys", self.transcript_keys().as_str()),
        ])
    }

    fn command(&self, config: &JobConfig) -> String {
        CommandLine::new("gemtools t-index")
            .opt("-i", &self.index)
            .opt("-a", &self.annotation)
            .opt("-o", self.prefix())
            .opt("-m", self.max_length.to_string())
            .threads(config)
            .build()
    }
}
