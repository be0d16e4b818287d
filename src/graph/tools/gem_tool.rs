use std::path::Path;

use crate::config::JobConfig;
use crate::graph::*;

pub struct GemTool {
    name: String,
    primary: String,
    secondary: Option<String>,
    index: String,
    transcript_index: String,
    annotation: String,
    quality: String,
    output_dir: String,
    single_end: bool,
    no_bam: bool,
}

impl GemTool {
    const NAME: &'static str = "gem";

    /// Map the reads of one dataset with the GEMtools RNA-seq pipeline.
    ///
    /// Outputs `<output_dir>/<name>.map.gz` and, unless disabled, the sorted
    /// BAM file with its `.bai` index.
    pub fn new(
        name: impl Into<String>,
        primary: impl Into<String>,
        index: impl Into<String>,
        transcript_index: impl Into<String>,
        annotation: impl Into<String>,
        quality: impl Into<String>,
        output_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            name: name.into(),
            primary: primary.into(),
            secondary: None,
            index: index.into(),
            transcript_index: transcript_index.into(),
            annotation: annotation.into(),
            quality: quality.into(),
            output_dir: output_dir.as_ref().display().to_string(),
            single_end: true,
            no_bam: false,
        }
    }

    pub fn secondary(mut self, secondary: Option<impl Into<String>>) -> Self {
        self.secondary = secondary.map(Into::into);
        self.single_end = self.secondary.is_none();
        self
    }

    pub fn no_bam(mut self, no_bam: bool) -> Self {
        self.no_bam = no_bam;
        self
    }

    fn output(&self, suffix: &str) -> String {
        Path::new(&self.output_dir)
            .join(format!("{}{suffix}", self.name))
            .display()
            .to_string()
    }

    pub fn map(&self) -> String {
        self.output(".map.gz")
    }

    pub fn bam(&self) -> Option<String> {
        (!self.no_bam).then(|| self.output(".bam"))
    }
}

impl Tool for GemTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Aligner
    }

    fn job_name(&self) -> String {
        format!("gem.{}", self.name)
    }

    fn inputs(&self) -> FileParams {
        let mut res = params([
            ("primary", self.primary.as_str()),
            ("index", self.index.as_str()),
            ("transcript_index", self.transcript_index.as_str()),
            ("annotation", self.annotation.as_str()),
        ]);
        if let Some(s) = &self.secondary {
            res.insert("secondary".to_owned(), s.clone());
        }
        res
    }

    fn outputs(&self) -> FileParams {
        let mut res = params([("map", self.map().as_str())]);
        if let Some(bam) = self.bam() {
            res.insert("bai".to_owned(), format!("{bam}.bai"));
            res.insert("bam".to_owned(), bam);
        }
        res
    }

    fn command(&self, config: &JobConfig) -> String {
        let fastq = match &self.secondary {
            Some(s) => format!("{} {}", quote(&self.primary), quote(s)),
            None => quote(&self.primary),
        };

        let cmd = CommandLine::new("gemtools rna-pipeline")
            .opt("-i", &self.index)
            .opt("-a", &self.annotation)
            .opt("-r", &self.transcript_index)
            .opt("-q", &self.quality)
            .opt("-n", &self.name)
            .opt("-o", &self.output_dir)
            .flag("--single-end", self.single_end)
            .flag("--no-bam", self.no_bam)
            .threads(config)
            .build();
        format!("{cmd} -f {fastq}")
    }
}
