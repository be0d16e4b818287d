use std::path::Path;

use rustc_hash::FxHashMap;

use crate::config::{Config, JobConfig};
use crate::dataset::Dataset;
use crate::errors::*;
use crate::graph::*;

/// An ordered list of tool invocations for one dataset.
pub struct Pipeline {
    name: String,
    tools: Vec<Box<dyn Tool>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn add(&mut self, tool: impl Tool + 'static) -> &mut Self {
        self.tools.push(Box::new(tool));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> impl Iterator<Item = &(dyn Tool + 'static)> {
        self.tools.iter().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Turn pipelines into one job graph.
///
/// Jobs doing the same work (same name and outputs) in several pipelines
/// become a single node. A job depends on every job producing one of its
/// inputs. Jobs whose outputs all exist start as DONE unless one of their
/// dependencies still has to run.
pub fn create_jobs<F>(pipelines: &[Pipeline], mut configure: F) -> Result<JobGraph>
where
    F: FnMut(&dyn Tool) -> Result<JobConfig>,
{
    let mut graph = JobGraph::new();
    let mut by_name = FxHashMap::<String, JobId>::default();
    let mut producers = FxHashMap::<String, JobId>::default();

    for p in pipelines {
        for tool in p.tools() {
            let mut job = tool.to_job(configure(tool)?);
            job.pipeline = Some(p.name().to_owned());

            let defined_twice = |job: &Job| Error::Pipeline {
                pipeline: p.name().to_owned(),
                reason: format!("job \"{}\" is defined twice with different outputs", job.name),
            };
            if let Some(&id) = by_name.get(&job.name) {
                if graph.job(id)?.same_work(&job) {
                    continue;
                }
                if !job.kind.is_setup() {
                    return Err(defined_twice(&job));
                }
                // same named references in different folders
                job.name = format!("{}.{}", job.name, inputs_digest(&job));
                if let Some(&id) = by_name.get(&job.name) {
                    if graph.job(id)?.same_work(&job) {
                        continue;
                    }
                    return Err(defined_twice(&job));
                }
            }

            let name = job.name.clone();
            let outputs = job.outputs.values().cloned().collect::<Vec<_>>();
            let id = graph.add(job);
            by_name.insert(name.clone(), id);

            for out in outputs {
                if let Some(other) = producers.insert(out.clone(), id) {
                    return Err(Error::Pipeline {
                        pipeline: p.name().to_owned(),
                        reason: format!(
                            "\"{out}\" is produced by \"{}\" and \"{name}\"",
                            graph.job(other)?.name
                        ),
                    });
                }
            }
        }
    }

    let ids = graph.ids().collect::<Vec<_>>();
    for &id in &ids {
        let inputs = graph.job(id)?.inputs.values().cloned().collect::<Vec<_>>();
        for input in inputs {
            if let Some(&parent) = producers.get(&input) {
                if parent != id {
                    graph.add_edge(parent, id)?;
                }
            }
        }
    }

    for id in graph.topological_order(&ids)? {
        let job = graph.job(id)?;
        let outputs_exist = !job.outputs.is_empty()
            && job.outputs.values().all(|o| Path::new(o).exists());
        let deps_done = job
            .dependencies
            .iter()
            .all(|d| graph.get(*d).map(|j| j.state == JobState::Done).unwrap_or(false));
        let state = if outputs_exist && deps_done {
            JobState::Done
        } else {
            JobState::Queued
        };
        graph.job_mut(id)?.state = state;
    }

    Ok(graph)
}

/// First eight hex digits of the md5 of the input paths of `job`.
fn inputs_digest(job: &Job) -> String {
    let mut ctx = md5::Context::new();
    for input in job.inputs.values() {
        ctx.consume(input.as_bytes());
        ctx.consume(b"\0");
    }
    format!("{:x}", ctx.compute())[..8].to_owned()
}

fn lookup(config: &Config, key: &str, specific: Option<String>) -> Option<String> {
    specific.or_else(|| config.get_str(key).filter(|v| !v.is_empty()))
}

/// Index the genome when no index is configured, build the transcriptome
/// index, map the reads and quantify the mappings.
///
/// Values specific to the dataset (by `sex` or its own `quality` tag) win
/// over project wide `genome`, `index`, `annotation` and `quality` settings.
pub fn default_pipeline(dataset: &Dataset, config: &Config) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(pipeline_name(dataset));
    let err = |reason: &str| Error::Pipeline {
        pipeline: pipeline_name(dataset),
        reason: reason.to_owned(),
    };

    let annotation = lookup(config, "annotation", dataset.get_annotation(config))
        .ok_or_else(|| err("no annotation configured"))?;
    let quality = lookup(
        config,
        "quality",
        dataset.get("quality").filter(|q| !q.is_empty()).map(str::to_owned),
    )
    .ok_or_else(|| err("no quality offset configured"))?;
    let primary = dataset
        .primary()
        .ok_or_else(|| err("dataset has no fastq files"))?
        .to_owned();
    let mappings = dataset
        .folder("mappings")
        .ok_or_else(|| err("dataset has no data folder"))?;
    let quantifications = dataset
        .folder("quantifications")
        .ok_or_else(|| err("dataset has no data folder"))?;

    let index = match lookup(config, "index", dataset.get_index(config)) {
        Some(index) => index,
        None => {
            let genome = lookup(config, "genome", dataset.get_genome(config))
                .ok_or_else(|| err("no genome or genome index configured"))?;
            let tool = GemIndexTool::new(genome);
            let index = tool.index();
            pipeline.add(tool);
            index
        }
    };

    let t_index = GemTranscriptomeIndexTool::new(&index, &annotation);
    let transcript_index = t_index.transcript_index();
    pipeline.add(t_index);

    let secondary = if dataset.single_end() {
        None
    } else {
        dataset.secondary()
    };
    let gem = GemTool::new(
        dataset.id(),
        primary,
        index,
        transcript_index,
        &annotation,
        quality,
        mappings,
    )
    .secondary(secondary);
    let bam = gem.bam().ok_or_else(|| err("aligner produces no BAM file"))?;
    pipeline.add(gem);

    pipeline.add(FluxTool::new(dataset.id(), bam, annotation).output_dir(quantifications));

    Ok(pipeline)
}

fn pipeline_name(dataset: &Dataset) -> String {
    format!("Default Pipeline {}", dataset.id())
}
