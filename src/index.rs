use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dataset::*;
use crate::errors::*;
use crate::lock::*;
use crate::metadata::Metadata;
use crate::parse_utils::*;

pub const DEFAULT_ID_FIELD: &str = "labExpId";

pub const DEFAULT_FILE_TYPES: &[&str] = &["fastq", "bam", "bai", "gff", "gtf", "map", "bigWig", "bed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// One line per file, keyed by the id field.
    Data,
    /// Metadata only lines with a `.` path are expected.
    Meta,
}

/// Describes how index lines map onto datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexFormat {
    pub id: String,
    pub fileinfo: Vec<String>,
    pub file_types: Vec<String>,
    pub kind: IndexKind,
}

impl Default for IndexFormat {
    fn default() -> Self {
        Self {
            id: DEFAULT_ID_FIELD.to_owned(),
            fileinfo: FILE_FIELDS.iter().map(|s| s.to_string()).collect(),
            file_types: DEFAULT_FILE_TYPES.iter().map(|s| s.to_string()).collect(),
            kind: IndexKind::Data,
        }
    }
}

impl IndexFormat {
    /// Parse a format given either as a JSON string or as a path to a JSON file.
    pub fn parse(format: &str) -> Result<Self> {
        let text = if Path::new(format).is_file() {
            fs::read_to_string(format).map_err(|e| Error::file_io(format, e))?
        } else {
            format.to_owned()
        };

        serde_json::from_str(&text).map_err(|e| Error::Parse {
            string: text.clone(),
            context: format.to_owned(),
            reason: if e.is_syntax() { "invalid JSON" } else { "invalid index format" },
        })
    }

    pub fn is_supported(&self, file_type: &FileType) -> bool {
        file_type.is_builtin() || self.file_types.iter().any(|t| t == file_type.as_str())
    }
}

/// The collection of all datasets of a project.
#[derive(Debug)]
pub struct Index {
    path: Option<PathBuf>,
    format: IndexFormat,
    datasets: BTreeMap<String, Dataset>,
    lock: Option<FileLock>,
    lock_timeout: Duration,
    skipped: usize,
}

impl Index {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_format(path, IndexFormat::default())
    }

    pub fn with_format(path: Option<PathBuf>, format: IndexFormat) -> Self {
        Self {
            path,
            format,
            datasets: BTreeMap::new(),
            lock: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            skipped: 0,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    pub fn format(&self) -> &IndexFormat {
        &self.format
    }

    pub fn set_format(&mut self, format: IndexFormat) {
        self.format = format;
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&Dataset> {
        self.datasets.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Dataset> {
        self.datasets.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn clear(&mut self) {
        self.datasets.clear();
    }

    /// Lines dropped during the last load.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn check_type(&self, metadata: &Metadata, path: &str) -> Result<()> {
        let file_type = match metadata.get_opt("type") {
            Some(t) if !t.is_empty() => Some(FileType::new(t)),
            _ => FileType::from_path(path),
        };

        match file_type {
            Some(t) if !self.format.is_supported(&t) => Err(Error::UnsupportedFileType(t.to_string())),
            _ => Ok(()),
        }
    }

    /// Add a dataset entry, creating the dataset on first sight. Tags of an
    /// existing dataset are overwritten only when `update` is set. A `path`
    /// tag other than `.` attaches a file.
    pub fn insert(&mut self, fields: &Metadata, update: bool) -> Result<()> {
        let id = fields
            .get_opt(&self.format.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::MissingId(self.format.id.clone()))?
            .to_owned();
        let path = fields.get_opt("path").filter(|p| !p.is_empty() && *p != META_PATH);

        if let Some(path) = path {
            self.check_type(fields, path)?;
        }

        match self.datasets.get_mut(&id) {
            Some(d) => d.merge_metadata(fields, update),
            None => {
                let d = Dataset::with_file_fields(fields, &self.format.id, &self.format.fileinfo)?;
                self.datasets.insert(id.clone(), d);
            }
        }

        if let Some(path) = path {
            let d = self.datasets.get_mut(&id).ok_or_else(|| Error::DatasetNotFound(id.clone()))?;
            d.add_file(path, fields)?;
        }

        Ok(())
    }

    /// Attach a file to an existing dataset.
    pub fn add(&mut self, id: &str, path: &str, fields: &Metadata) -> Result<()> {
        self.check_type(fields, path)?;
        let d = self
            .datasets
            .get_mut(id)
            .ok_or_else(|| Error::DatasetNotFound(id.to_owned()))?;
        d.add_file(path, fields)
    }

    fn insert_line(&mut self, path: &str, tags: Vec<(String, String)>) -> Result<()> {
        let mut fields = Metadata::new();
        fields.extend(tags);
        if path != META_PATH {
            fields.extend([("path", path)]);
        }
        self.insert(&fields, true)
    }

    /// Read index lines from `reader`. Returns the number of skipped lines.
    pub fn load_reader(&mut self, reader: impl BufRead, context: &str) -> Result<usize> {
        let mut skipped = 0;

        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::file_io(context, e))?;
            if line.trim().is_empty() {
                continue;
            }

            let res = match parse_line(&line) {
                Some((path, tags)) => self.insert_line(path, tags),
                None => Err(Error::Parse {
                    string: line.clone(),
                    context: context.to_owned(),
                    reason: "expected <path><TAB><tags>",
                }),
            };

            if let Err(e) = res {
                if matches!(e, Error::DuplicateKey { .. }) {
                    return Err(e);
                }
                tracing::warn!(file = context, line = i + 1, "skipping index line: {e}");
                skipped += 1;
            }
        }

        self.skipped = skipped;
        Ok(skipped)
    }

    /// Load an index file. With `clear`, datasets in memory are dropped first.
    pub fn load(&mut self, path: impl AsRef<Path>, clear: bool) -> Result<usize> {
        let path = path.as_ref();
        if clear {
            self.clear();
        }

        let file = File::open(path).map_err(|e| Error::file_io(path, e))?;
        self.load_reader(BufReader::new(file), &path.display().to_string())
    }

    /// Load the backing file if it exists.
    pub fn open(&mut self) -> Result<usize> {
        match self.path.clone() {
            Some(p) if p.exists() => self.load(p, true),
            _ => Ok(0),
        }
    }

    fn detect_separator(path: &Path) -> Result<u8> {
        let file = File::open(path).map_err(|e| Error::file_io(path, e))?;
        let mut header = String::new();
        BufReader::new(file)
            .read_line(&mut header)
            .map_err(|e| Error::file_io(path, e))?;
        Ok(if header.contains('\t') { b'\t' } else { b',' })
    }

    /// Import datasets from delimited text with a header row. The first
    /// column holds dataset ids unless `id_column` names another one; its
    /// values are stored under this index's id field, and another column
    /// named like the id field is ignored. When a header repeats, the last
    /// non empty value wins. Rows for known ids are skipped unless they
    /// carry a `path` for a new file. Returns the number of imported rows.
    pub fn import_delimited(
        &mut self,
        path: impl AsRef<Path>,
        separator: Option<u8>,
        id_column: Option<&str>,
    ) -> Result<usize> {
        let path = path.as_ref();
        let separator = match separator {
            Some(s) => s,
            None => Self::detect_separator(path)?,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| Error::file_io(path, e))?;

        let headers = rdr.headers().map_err(|e| Error::file_io(path, e))?.clone();
        let id_column = match id_column {
            Some(c) => c.to_owned(),
            None => headers
                .get(0)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| Error::Parse {
                    string: String::new(),
                    context: path.display().to_string(),
                    reason: "missing header row",
                })?
                .to_owned(),
        };
        if !headers.iter().any(|h| h == id_column) {
            return Err(Error::MissingId(id_column));
        }

        let mut imported = 0;
        for record in rdr.records() {
            let record = record.map_err(|e| Error::file_io(path, e))?;

            let mut fields = Metadata::new();
            for (key, value) in headers.iter().zip(record.iter()) {
                if value.is_empty() {
                    continue;
                }
                let key = if key == id_column {
                    self.format.id.as_str()
                } else if key == self.format.id {
                    continue;
                } else {
                    key
                };
                check_valid_key(key)?;
                fields.extend([(key, value)]);
            }

            let Some(id) = fields.get_opt(&self.format.id) else {
                tracing::warn!(file = %path.display(), "skipping row without id");
                continue;
            };
            if self.datasets.contains_key(id) && !fields.contains("path") {
                continue;
            }

            self.insert(&fields, false)?;
            imported += 1;
        }

        Ok(imported)
    }

    fn root(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    pub fn export_lines(&self, absolute: bool) -> Vec<String> {
        self.datasets
            .values()
            .flat_map(|d| d.export(absolute, self.root(), None))
            .collect()
    }

    pub fn export_json(&self, absolute: bool) -> Vec<String> {
        self.datasets
            .values()
            .flat_map(|d| d.to_json(absolute, self.root()))
            .map(|v| v.to_string())
            .collect()
    }

    /// Write all lines to `out`, each newline terminated.
    pub fn export(&self, out: &mut impl Write, absolute: bool) -> io::Result<()> {
        for line in self.export_lines(absolute) {
            writeln!(out, "{line}")?;
        }
        out.flush()
    }

    /// Write the index to its backing file, or to stdout when there is none.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            let stdout = io::stdout();
            return self
                .export(&mut stdout.lock(), false)
                .map_err(|e| Error::BytesIo(Box::new(e)));
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let file = File::create(&tmp).map_err(|e| Error::file_io(&tmp, e))?;
        self.export(&mut BufWriter::new(file), false)
            .map_err(|e| Error::file_io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Error::file_io(path, e))
    }

    /// A copy holding the datasets with the given ids (all when empty) that
    /// match every `key=value` filter. The copy has no backing file.
    pub fn select(&self, ids: &[String], filters: &[(String, String)]) -> Index {
        let datasets = self
            .datasets
            .iter()
            .filter(|(id, _)| ids.is_empty() || ids.contains(id))
            .filter(|(_, d)| {
                filters
                    .iter()
                    .all(|(k, v)| d.attr(k).map(|a| &a == v).unwrap_or(false))
            })
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();

        Index {
            path: None,
            format: self.format.clone(),
            datasets,
            lock: None,
            lock_timeout: self.lock_timeout,
            skipped: 0,
        }
    }

    /// Lock the backing file. Returns `false` if this index already holds the lock.
    pub fn lock(&mut self) -> Result<bool> {
        if self.lock.is_some() {
            return Ok(false);
        }

        let path = self.path.as_ref().ok_or_else(|| Error::LockingFailed {
            file: String::new(),
            reason: "index has no backing file".to_owned(),
        })?;
        self.lock = Some(FileLock::acquire(path, self.lock_timeout)?);
        Ok(true)
    }

    /// Release the lock. Returns `false` when it was not held.
    pub fn release(&mut self) -> bool {
        self.lock.take().is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}
