//! RNA-seq pipeline orchestration for grape projects.
//!
//! # Overview
//! A grape project is a folder holding a `.grape` directory with the project
//! configuration, a dataset index (`.index`) and the data files themselves.
//! Datasets are grouped sets of files (reads, alignments, quantifications)
//! that share one id and a set of metadata tags.
//!
//! Grape turns datasets into jobs for external tools, resolves the jobs
//! against what has been run before, and runs them locally or submits them
//! to a cluster, recording their state as it goes.
//!
//! ## Index
//! The index is a line based text file. Every line names a file followed by
//! a tab and `key=value;` tags:
//! ```text
//! ./data/test_1.fastq.gz	labExpId=test; type=fastq; view=FastqRd1; quality=33;
//! ./data/test_2.fastq.gz	labExpId=test; type=fastq; view=FastqRd2; quality=33;
//! ```
//! Lines are merged into [`Dataset`]s by their id field (`labExpId` by
//! default). Which tags belong to a file rather than to the dataset is
//! decided by the [`IndexFormat`].
//!
//! An [`Index`] can be locked while it is read, modified and written back,
//! so jobs finishing concurrently do not lose each other's updates.
//!
//! ## Jobs
//! Each [`Tool`] (indexer, aligner, quantifier) turns into a [`Job`] with
//! named input and output files. A [`Pipeline`] is an ordered list of tools;
//! [`create_jobs`] links them into a [`JobGraph`] where a job depends on the
//! producers of its inputs.
//!
//! Setup jobs such as genome indexing are shared between runs. Before a graph
//! runs, [`check_jobs_dependencies`] looks for equivalent jobs in the
//! [`JobDatabase`] and reuses them, or removes them (and everything built on
//! them) if they failed.
//!
//! Job states are kept per pipeline in a [`PipelineStore`] and updated by
//! [`JobListener`]s as jobs start and finish.

pub mod config;
pub mod dataset;
pub mod errors;
pub mod graph;
pub mod index;
pub mod jobs;
pub mod lock;
pub mod metadata;
pub mod parse_utils;
pub mod project;

// commonly used functions and types

pub use crate::config::*;
pub use crate::dataset::*;
pub use crate::errors::*;
pub use crate::graph::*;
pub use crate::index::*;
pub use crate::jobs::*;
pub use crate::metadata::*;
pub use crate::project::*;
