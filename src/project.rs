use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::Config;
use crate::dataset::*;
use crate::errors::*;
use crate::index::*;
use crate::metadata::Metadata;
use crate::parse_utils::parse_line;

pub const GRAPE_DIR: &str = ".grape";
pub const INDEX_FILE: &str = ".index";
pub const FORMAT_FILE: &str = ".grape/format.json";
pub const LOG_DIR: &str = ".grape/logs";
pub const JOB_DB_FILE: &str = ".grape/jobs.db";

pub const DATA_FOLDER: &str = "data";
pub const GENOME_FOLDER: &str = "genomes";
pub const ANNOTATION_FOLDER: &str = "annotations";

lazy_static! {
    static ref FASTQ_RE: Regex = Regex::new(r".*\.(fastq|fq)(\.gz)?$").unwrap();
    static ref PAIRED_RE: Regex =
        Regex::new(r"^(?P<name>.*)(?P<delim>[_.-])(?P<id>\d)\.(?P<type>fastq|fq)(?P<compression>\.gz)?$").unwrap();
    static ref SINGLE_RE: Regex = Regex::new(r"^(?P<name>.*)\.(fastq|fq)(\.gz)?$").unwrap();
    static ref GROUP_RE: Regex = Regex::new(r"^(?P<name>.*)(?P<id>\d)\.(fastq|fq)(\.gz)?$").unwrap();
}

/// How data files are arranged below `data/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FolderLayout {
    /// Everything in `data/`.
    #[default]
    Flat,
    /// One folder per file type, e.g. `data/fastq`, `data/mappings`.
    Type,
    /// One folder per dataset.
    Dataset,
}

impl FolderLayout {
    const KEY: &'static str = "_folders";

    fn from_config(config: &Config) -> Self {
        match config.get_str(Self::KEY).as_deref() {
            Some("type") => FolderLayout::Type,
            Some("dataset") => FolderLayout::Dataset,
            _ => FolderLayout::Flat,
        }
    }

    fn as_config(&self) -> Option<&'static str> {
        match self {
            FolderLayout::Flat => None,
            FolderLayout::Type => Some("type"),
            FolderLayout::Dataset => Some("dataset"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub found: usize,
    pub new: usize,
    pub datasets: Vec<String>,
}

/// A grape project: a folder with a `.grape` directory, a configuration
/// and a dataset index.
#[derive(Debug)]
pub struct Project {
    path: PathBuf,
    config: Config,
    index: Index,
}

impl Project {
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(GRAPE_DIR).is_dir()
    }

    /// Walk up from `start` to the first folder holding a project.
    pub fn find(start: impl AsRef<Path>) -> Option<PathBuf> {
        start
            .as_ref()
            .ancestors()
            .find(|p| Self::exists(p))
            .map(Path::to_path_buf)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !Self::exists(&path) {
            return Err(Error::Project(format!("no grape project at {}", path.display())));
        }

        let config = Config::open(&path)?;
        let format_file = path.join(FORMAT_FILE);
        let format = if format_file.exists() {
            IndexFormat::parse(&format_file.display().to_string())?
        } else {
            IndexFormat::default()
        };

        let mut index = Index::with_format(Some(path.join(INDEX_FILE)), format);
        let skipped = index.open()?;
        if skipped > 0 {
            tracing::warn!(skipped, "index lines could not be read");
        }

        Ok(Self { path, config, index })
    }

    /// Create the project folders. An existing project is opened as is.
    pub fn init(path: impl Into<PathBuf>, structure: bool, layout: FolderLayout) -> Result<Self> {
        let path = path.into();
        if Self::exists(&path) {
            return Self::open(path);
        }

        mkdir(&path.join(GRAPE_DIR))?;
        let mut config = Config::open(&path)?;
        if let Some(folders) = layout.as_config() {
            config.set(FolderLayout::KEY, folders);
        }
        config.save()?;

        if structure {
            for folder in [ANNOTATION_FOLDER, GENOME_FOLDER, DATA_FOLDER] {
                mkdir(&path.join(folder))?;
            }
            if layout == FolderLayout::Type {
                mkdir(&path.join(DATA_FOLDER).join("fastq"))?;
            }
        }

        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    pub fn format_path(&self) -> PathBuf {
        self.path.join(FORMAT_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.path.join(crate::jobs::JOBS_DIR)
    }

    /// Job database file, `jip.db` in the configuration overrides the default.
    pub fn job_db_path(&self) -> PathBuf {
        match self.config.get_str("jip.db").filter(|p| !p.is_empty()) {
            Some(p) => self.path.join(p),
            None => self.path.join(JOB_DB_FILE),
        }
    }

    pub fn layout(&self) -> FolderLayout {
        FolderLayout::from_config(&self.config)
    }

    /// `data/<name>` for type folders, `data/<dataset>` for dataset
    /// folders and `data` otherwise.
    pub fn folder(&self, name: &str, dataset: Option<&str>) -> PathBuf {
        let data = self.path.join(DATA_FOLDER);
        match (self.layout(), dataset) {
            (FolderLayout::Type, _) => data.join(name),
            (FolderLayout::Dataset, Some(d)) => data.join(d),
            _ => data,
        }
    }

    fn list_folder(&self, folder: &str, suffixes: &[&str]) -> Result<Vec<PathBuf>> {
        let dir = self.path.join(folder);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut res = fs::read_dir(&dir)
            .map_err(|e| Error::file_io(&dir, e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                let name = p.to_string_lossy();
                suffixes.iter().any(|s| name.ends_with(s))
            })
            .collect::<Vec<_>>();
        res.sort();
        Ok(res)
    }

    /// `.gem` files in `genomes/`.
    pub fn get_indices(&self) -> Result<Vec<PathBuf>> {
        self.list_folder(GENOME_FOLDER, &[".gem"])
    }

    /// GTF files in `annotations/`.
    pub fn get_annotations(&self) -> Result<Vec<PathBuf>> {
        self.list_folder(ANNOTATION_FOLDER, &[".gtf", ".gtf.gz"])
    }

    /// Datasets with the given ids (all when empty) matching all filters.
    pub fn get_datasets(&self, ids: &[String], filters: &[(String, String)]) -> Result<Vec<Dataset>> {
        let selected = self.index.select(ids, filters);
        for id in ids {
            if self.index.get(id).is_none() {
                return Err(Error::DatasetNotFound(id.clone()));
            }
        }
        Ok(selected.datasets().cloned().collect())
    }

    pub fn save(&self) -> Result<()> {
        self.index.save()
    }

    /// Run `f` on the freshly loaded index with the index file locked, then
    /// save it. Nested calls reuse the outer lock and leave the saving to it.
    pub fn update_index<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.index.lock()? {
            return f(self);
        }

        let res = self.index.open().and_then(|_| f(self));
        let res = res.and_then(|value| self.index.save().map(|_| value));
        self.index.release();
        res
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.path)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.path.join(p.strip_prefix("./").unwrap_or(p))
        }
    }

    /// Link a reference file into the folder matching its extension:
    /// genomes and indices into `genomes/`, annotations into `annotations/`
    /// and reads into `data/`. Returns the project relative link, or `None`
    /// for unknown file kinds.
    pub fn link_reference(&self, file: &Path) -> Result<Option<String>> {
        let name = file.to_string_lossy();
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        let folder = match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("fa" | "fasta" | "gem") => self.path.join(GENOME_FOLDER),
            Some("gtf" | "gff") => self.path.join(ANNOTATION_FOLDER),
            Some("fastq" | "fq") => self.folder("fastq", None),
            _ => return Ok(None),
        };
        let link = make_link(file, &folder)?;
        Ok(Some(self.relative(&link)))
    }

    /// Register `file` for dataset `id` and save the index. Files outside
    /// the project data folder are linked into it first.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dataset(
        &mut self,
        id: &str,
        file: &Path,
        fields: &Metadata,
        link: bool,
        compute_stats: bool,
        update: bool,
        absolute: bool,
    ) -> Result<PathBuf> {
        self.update_index(|p| p.add_file(id, file, fields, link, compute_stats, update, absolute))
    }

    #[allow(clippy::too_many_arguments)]
    fn add_file(
        &mut self,
        id: &str,
        file: &Path,
        fields: &Metadata,
        link: bool,
        compute_stats: bool,
        update: bool,
        absolute: bool,
    ) -> Result<PathBuf> {
        let data = self.path.join(DATA_FOLDER);
        let in_data = file.parent().map(|p| p.starts_with(&data)).unwrap_or(false);

        let target = if link && !in_data {
            make_link(file, &self.folder("fastq", Some(id)))?
        } else {
            file.to_path_buf()
        };

        let path = if absolute {
            target.display().to_string()
        } else {
            self.relative(&target)
        };
        let mut info = fields.clone();
        info.extend([(self.index.format().id.as_str(), id), ("path", path.as_str())]);
        if !info.contains("type") {
            if let Some(t) = FileType::from_path(&target.to_string_lossy()) {
                info.extend([("type", t.as_str())]);
            }
        }
        if compute_stats {
            let (md5, size) = file_stats(&target)?;
            info.extend([("md5", md5), ("size", size.to_string())]);
        }

        tracing::info!(dataset = id, file = %target.display(), "adding file");
        self.index.insert(&info, update)?;
        Ok(target)
    }

    /// Register new fastq files below `dir` (the fastq folder by default),
    /// pairing mates into one dataset. With `id`, datasets are named after
    /// it, with a counter suffix when more than one is found.
    pub fn scan(
        &mut self,
        dir: Option<&Path>,
        fields: &Metadata,
        id: Option<&str>,
        compute_stats: bool,
        update: bool,
        absolute: bool,
    ) -> Result<ScanSummary> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| self.folder("fastq", None));
        let fastqs = search_fastq_files(&dir)?;
        self.update_index(|p| p.scan_files(fastqs, fields, id, compute_stats, update, absolute))
    }

    fn scan_files(
        &mut self,
        fastqs: Vec<PathBuf>,
        fields: &Metadata,
        id: Option<&str>,
        compute_stats: bool,
        update: bool,
        absolute: bool,
    ) -> Result<ScanSummary> {

        let known = self
            .index
            .datasets()
            .flat_map(|d| d.files(&FileType::Fastq))
            .map(|f| canonical(&self.resolve(f.path())))
            .collect::<BTreeSet<_>>();
        let new = fastqs
            .iter()
            .filter(|f| !known.contains(&canonical(f)))
            .cloned()
            .collect::<Vec<_>>();

        let mut summary = ScanSummary {
            found: fastqs.len(),
            new: new.len(),
            datasets: Vec::new(),
        };

        let mut groups = BTreeMap::<String, Vec<PathBuf>>::new();
        for f in &new {
            let name = f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if let Some(c) = GROUP_RE.captures(&name) {
                groups.entry(c["name"].to_owned()).or_default().push(f.clone());
            }
        }

        let mut datasets = Vec::<(String, Vec<PathBuf>)>::new();
        for (name, files) in groups {
            if files.len() == 2 {
                let name = name.trim_end_matches(['-', '.', '_']).to_owned();
                datasets.push((name, files));
            }
        }
        let paired = datasets.iter().flat_map(|(_, fs)| fs.iter()).cloned().collect::<BTreeSet<_>>();
        for f in new.iter().filter(|f| !paired.contains(*f)) {
            let name = f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let name = SINGLE_RE
                .captures(&name)
                .map(|c| c["name"].to_owned())
                .unwrap_or(name);
            datasets.push((name, vec![f.clone()]));
        }

        let add_counter = id.is_some() && datasets.len() > 1;
        let mut fields = fields.clone();
        fields.extend([("type", "fastq")]);

        for (counter, (name, files)) in datasets.into_iter().enumerate() {
            let ds_id = match id {
                Some(id) if add_counter => format!("{id}_{}", counter + 1),
                Some(id) => id.to_owned(),
                None => name,
            };
            for f in &files {
                self.add_file(&ds_id, f, &fields, true, compute_stats, update, absolute)?;
            }
            summary.datasets.push(ds_id);
        }

        Ok(summary)
    }

    /// Merge an index or delimited metadata file into the project. Fastq
    /// files outside of the data folder are linked into it.
    pub fn import(&mut self, path: &Path, format: Option<IndexFormat>, compute_stats: bool) -> Result<()> {
        if let Some(format) = format {
            let format_path = self.format_path();
            if !format_path.exists() {
                crate::config::write_json(&format_path, &format)?;
            }
            self.index.set_format(format);
        }

        self.update_index(|p| p.import_file(path, compute_stats))
    }

    fn import_file(&mut self, path: &Path, compute_stats: bool) -> Result<()> {
        if is_index_file(path)? {
            self.index.load(path, false)?;
        } else {
            self.index.import_delimited(path, None, None)?;
        }

        let data = self.path.join(DATA_FOLDER);
        let mut moves = Vec::new();
        for d in self.index.datasets() {
            for f in d.files(&FileType::Fastq) {
                let resolved = self.resolve(f.path());
                if !resolved.starts_with(&data) && resolved.exists() {
                    moves.push((d.id().to_owned(), f.path().to_owned(), resolved, f.tags().clone()));
                }
            }
        }

        for (id, original, resolved, tags) in moves {
            if let Some(d) = self.index.get_mut(&id) {
                d.remove_file(&original, &FileType::Fastq);
            }
            self.add_file(&id, &resolved, &tags, true, compute_stats, true, false)?;
        }

        Ok(())
    }
}

fn mkdir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::Project(format!("unable to create folder {}: {e}", path.display())))
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// True if the first non blank line of `path` looks like an index line.
fn is_index_file(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| Error::file_io(path, e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::file_io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        return Ok(parse_line(&line).map(|(_, tags)| !tags.is_empty()).unwrap_or(false));
    }
    Ok(false)
}

/// Link `src` into `dest_dir` and return the link. A link already pointing
/// at `src` is kept.
pub fn make_link(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    if !src.exists() {
        return Err(Error::Project(format!("the file {} does not exist", src.display())));
    }
    mkdir(dest_dir)?;

    let file_name = src
        .file_name()
        .ok_or_else(|| Error::Project(format!("not a file: {}", src.display())))?;
    let dst = dest_dir.join(file_name);
    let src = canonical(src);

    if canonical(&dst) == src {
        return Ok(dst);
    }
    if dst.is_symlink() {
        fs::remove_file(&dst).map_err(|e| Error::file_io(&dst, e))?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(&src, &dst).map_err(|e| Error::file_io(&dst, e))?;
    #[cfg(not(unix))]
    fs::hard_link(&src, &dst).map_err(|e| Error::file_io(&dst, e))?;

    Ok(dst)
}

/// Fastq files (`.fastq`, `.fq`, optionally gzipped) below `dir`, sorted.
pub fn search_fastq_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut res = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).map_err(|e| Error::file_io(&d, e))? {
            let path = entry.map_err(|e| Error::file_io(&d, e))?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| FASTQ_RE.is_match(n))
                .unwrap_or(false)
            {
                res.push(path);
            }
        }
    }

    res.sort();
    Ok(res)
}

/// Dataset name and files for a fastq path. Paired files named
/// `<name><delim><1|2>.fastq[.gz]` also yield the mate, sorted.
pub fn find_dataset(path: impl AsRef<Path>) -> Option<(String, Vec<PathBuf>)> {
    let path = path.as_ref();
    let name = path.file_name()?.to_str()?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    if let Some(c) = PAIRED_RE.captures(name) {
        if let Ok(id) = c["id"].parse::<u32>() {
            let mate = if id < 2 { id + 1 } else { id - 1 };
            let compression = c.name("compression").map(|m| m.as_str()).unwrap_or("");
            let mate = dir.join(format!("{}{}{mate}.{}{compression}", &c["name"], &c["delim"], &c["type"]));
            let mut files = vec![path.to_path_buf(), mate];
            files.sort();
            return Some((c["name"].to_owned(), files));
        }
    }

    SINGLE_RE
        .captures(name)
        .map(|c| (c["name"].to_owned(), vec![path.to_path_buf()]))
}
