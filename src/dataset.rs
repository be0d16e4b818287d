use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::config::Config;
use crate::errors::*;
use crate::metadata::Metadata;
use crate::parse_utils::*;

/// Tags that describe a single file rather than the dataset.
pub const FILE_FIELDS: &[&str] = &["type", "view", "md5", "size", "path"];

/// Folder name that marks a type segregated data layout.
const FASTQ_FOLDER: &str = "fastq";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Fastq,
    Bam,
    Bai,
    Gff,
    Gtf,
    Map,
    BigWig,
    Bed,
    Other(String),
}

impl FileType {
    pub fn new(name: &str) -> Self {
        use FileType::*;
        match name {
            "fastq" => Fastq,
            "bam" => Bam,
            "bai" => Bai,
            "gff" => Gff,
            "gtf" => Gtf,
            "map" => Map,
            "bigWig" => BigWig,
            "bed" => Bed,
            other => Other(other.to_owned()),
        }
    }

    /// Guess the type from a file name, ignoring a trailing `.gz`.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.strip_suffix(".gz").unwrap_or(path);
        let ext = Path::new(name).extension()?.to_str()?;
        Some(match ext {
            "fq" => FileType::Fastq,
            "bw" => FileType::BigWig,
            ext => FileType::new(ext),
        })
    }

    pub fn as_str(&self) -> &str {
        use FileType::*;
        match self {
            Fastq => "fastq",
            Bam => "bam",
            Bai => "bai",
            Gff => "gff",
            Gtf => "gtf",
            Map => "map",
            BigWig => "bigWig",
            Bed => "bed",
            Other(s) => s,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, FileType::Other(_))
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One file attached to a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    path: String,
    file_type: FileType,
    tags: Metadata,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, file_type: FileType, tags: Metadata) -> Self {
        let mut tags = tags;
        tags.remove("path");
        tags.remove("type");
        Self {
            path: path.into(),
            file_type,
            tags,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_type(&self) -> &FileType {
        &self.file_type
    }

    pub fn size(&self) -> Option<&str> {
        self.tags.get_opt("size")
    }

    pub fn md5(&self) -> Option<&str> {
        self.tags.get_opt("md5")
    }

    pub fn view(&self) -> Option<&str> {
        self.tags.get_opt("view")
    }

    pub fn tags(&self) -> &Metadata {
        &self.tags
    }

    /// `type` first, then the remaining file tags.
    fn export_tags(&self, exclude: &[&str]) -> String {
        let mut fields = Metadata::new();
        fields.extend([("type", self.file_type.as_str())]);
        fields.extend(self.tags.iter());
        fields.get_tags(None, exclude, TAG_JOINER)
    }
}

/// Hex md5 digest and size in bytes of a file.
pub fn file_stats(path: impl AsRef<Path>) -> Result<(String, u64)> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| Error::file_io(path, e))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).map_err(|e| Error::file_io(path, e))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
        size += n as u64;
    }

    Ok((format!("{:x}", ctx.compute()), size))
}

/// Pairing attributes derived from the sorted fastq files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FastqLayout {
    primary: Option<String>,
    secondary: Option<String>,
    data_folder: Option<PathBuf>,
    type_folders: bool,
}

impl FastqLayout {
    fn from_files(files: &[FileInfo]) -> Self {
        let primary = files.first().map(|f| f.path.clone());
        let secondary = files.get(1).map(|f| f.path.clone());

        let parent = primary
            .as_deref()
            .and_then(|p| Path::new(p).parent())
            .map(Path::to_path_buf);
        let type_folders = parent
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n == FASTQ_FOLDER)
            .unwrap_or(false);
        let data_folder = if type_folders {
            parent.as_deref().and_then(Path::parent).map(Path::to_path_buf)
        } else {
            parent
        };

        Self {
            primary,
            secondary,
            data_folder,
            type_folders,
        }
    }
}

/// Files and shared tags of one sample.
#[derive(Debug, Clone)]
pub struct Dataset {
    id_field: String,
    file_fields: Vec<String>,
    metadata: Metadata,
    files: BTreeMap<String, Vec<FileInfo>>,
    layout: FastqLayout,
}

impl Dataset {
    /// Create a dataset from `metadata`, which must contain `id_field`.
    /// File specific tags are not copied.
    pub fn new(metadata: &Metadata, id_field: &str) -> Result<Self> {
        Self::with_file_fields(metadata, id_field, FILE_FIELDS)
    }

    pub fn with_file_fields<S: AsRef<str>>(
        metadata: &Metadata,
        id_field: &str,
        file_fields: &[S],
    ) -> Result<Self> {
        let mut fields = FILE_FIELDS.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        for f in file_fields {
            if !fields.iter().any(|x| x == f.as_ref()) {
                fields.push(f.as_ref().to_owned());
            }
        }

        let exclude = fields.iter().map(String::as_str).collect::<Vec<_>>();
        let (_, shared) = metadata.partition(&exclude);

        if !shared.contains(id_field) {
            return Err(Error::MissingId(id_field.to_owned()));
        }

        Ok(Self {
            id_field: id_field.to_owned(),
            file_fields: fields,
            metadata: shared,
            files: BTreeMap::new(),
            layout: FastqLayout::default(),
        })
    }

    pub fn id(&self) -> &str {
        // checked at construction
        self.metadata.get_opt(&self.id_field).unwrap_or_default()
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn file_fields(&self) -> impl Iterator<Item = &str> {
        self.file_fields.iter().map(String::as_str)
    }

    /// Merge shared tags. Existing values are replaced only when `update` is set.
    pub fn merge_metadata(&mut self, metadata: &Metadata, update: bool) {
        let exclude = self.file_fields.iter().map(String::as_str).collect::<Vec<_>>();
        let (_, shared) = metadata.partition(&exclude);
        let pairs = shared
            .iter()
            .filter(|(k, _)| *k != self.id_field && (update || !self.metadata.contains(k)))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect::<Vec<_>>();
        self.metadata.extend(pairs);
    }

    /// Attach a file. A file with the same path and type replaces the
    /// previous entry.
    pub fn add_file(&mut self, path: &str, metadata: &Metadata) -> Result<()> {
        let file_fields = self.file_fields.iter().map(String::as_str).collect::<Vec<_>>();
        let (file_tags, _) = metadata.partition(&file_fields);

        let file_type = match file_tags.get_opt("type") {
            Some(t) if !t.is_empty() => FileType::new(t),
            _ => FileType::from_path(path).ok_or_else(|| Error::KeyNotFound("type".to_owned()))?,
        };
        let info = FileInfo::new(path, file_type.clone(), file_tags);

        let list = self.files.entry(file_type.as_str().to_owned()).or_default();
        match list.iter_mut().find(|f| f.path == path) {
            Some(existing) => *existing = info,
            None => list.push(info),
        }
        list.sort_by(|a, b| a.path.cmp(&b.path));

        if file_type == FileType::Fastq {
            self.layout = FastqLayout::from_files(list);
        }

        Ok(())
    }

    pub fn remove_file(&mut self, path: &str, file_type: &FileType) -> Option<FileInfo> {
        let list = self.files.get_mut(file_type.as_str())?;
        let pos = list.iter().position(|f| f.path == path)?;
        let removed = list.remove(pos);

        if list.is_empty() {
            self.files.remove(file_type.as_str());
        }
        if *file_type == FileType::Fastq {
            self.layout = FastqLayout::from_files(self.files(&FileType::Fastq));
        }

        Some(removed)
    }

    pub fn files(&self, file_type: &FileType) -> &[FileInfo] {
        self.files
            .get(file_type.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn file_types(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn all_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values().flatten()
    }

    pub fn num_files(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn primary(&self) -> Option<&str> {
        self.layout.primary.as_deref()
    }

    pub fn secondary(&self) -> Option<&str> {
        self.layout.secondary.as_deref()
    }

    pub fn data_folder(&self) -> Option<&Path> {
        self.layout.data_folder.as_deref()
    }

    pub fn type_folders(&self) -> bool {
        self.layout.type_folders
    }

    /// Folder for outputs of kind `name`: a sibling of `fastq` in a type
    /// segregated layout, the data folder itself otherwise.
    pub fn folder(&self, name: &str) -> Option<PathBuf> {
        let base = self.data_folder()?;
        if self.type_folders() {
            Some(base.join(name))
        } else {
            Some(base.to_path_buf())
        }
    }

    pub fn single_end(&self) -> bool {
        match self.metadata.get_opt("readType") {
            Some(rt) => !rt.to_uppercase().contains("2X"),
            None => self.files(&FileType::Fastq).len() <= 1,
        }
    }

    pub fn stranded(&self) -> bool {
        self.metadata
            .get_opt("readType")
            .map(|rt| rt.to_uppercase().ends_with('D'))
            .unwrap_or(false)
    }

    /// A shared metadata tag.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.metadata.get_opt(field)
    }

    /// A derived attribute or a shared metadata tag.
    pub fn attr(&self, field: &str) -> Result<String> {
        let derived = match field {
            "id" => Some(self.id().to_owned()),
            "primary" => self.primary().map(str::to_owned),
            "secondary" => self.secondary().map(str::to_owned),
            "single_end" => Some(self.single_end().to_string()),
            "stranded" => Some(self.stranded().to_string()),
            _ => self.get(field).map(str::to_owned),
        };

        derived.ok_or_else(|| Error::AttributeNotFound {
            dataset: self.id().to_owned(),
            attr: field.to_owned(),
        })
    }

    fn by_sex(&self, config: &Config, section: &str, key: &str) -> Option<String> {
        let sex = self.get("sex").filter(|s| !s.is_empty())?;
        config
            .get_str(&format!("{section}.{sex}.{key}"))
            .filter(|s| !s.is_empty())
    }

    pub fn get_genome(&self, config: &Config) -> Option<String> {
        self.by_sex(config, "genomes", "path")
    }

    pub fn get_index(&self, config: &Config) -> Option<String> {
        self.by_sex(config, "genomes", "index")
    }

    pub fn get_annotation(&self, config: &Config) -> Option<String> {
        self.by_sex(config, "annotations", "path")
    }

    fn resolve(path: &str, absolute: bool, root: Option<&Path>) -> String {
        match root {
            Some(root) if absolute && Path::new(path).is_relative() => {
                let p = path.strip_prefix("./").unwrap_or(path);
                root.join(p).display().to_string()
            }
            _ => path.to_owned(),
        }
    }

    /// Index lines for this dataset, one per file of the requested types.
    /// A dataset without files exports a single metadata line.
    pub fn export(&self, absolute: bool, root: Option<&Path>, types: Option<&[&str]>) -> Vec<String> {
        let shared = self.metadata.get_tags(None, &[], TAG_JOINER);

        if self.files.is_empty() {
            return vec![format!("{META_PATH}\t{shared}")];
        }

        let exclude = ["path", self.id_field.as_str()];
        self.files
            .iter()
            .filter(|(t, _)| types.map(|ts| ts.contains(&t.as_str())).unwrap_or(true))
            .flat_map(|(_, files)| files.iter())
            .map(|f| {
                let file_tags = f.export_tags(&exclude);
                let path = Self::resolve(&f.path, absolute, root);
                if file_tags.is_empty() {
                    format!("{path}\t{shared}")
                } else {
                    format!("{path}\t{shared}{TAG_JOINER}{file_tags}")
                }
            })
            .collect()
    }

    /// One JSON object per file with shared and file tags merged.
    pub fn to_json(&self, absolute: bool, root: Option<&Path>) -> Vec<Value> {
        let shared = self
            .metadata
            .iter()
            .map(|(k, v)| (k.to_owned(), Value::String(v.to_owned())))
            .collect::<Map<_, _>>();

        if self.files.is_empty() {
            return vec![Value::Object(shared)];
        }

        self.all_files()
            .map(|f| {
                let mut obj = shared.clone();
                obj.insert("path".to_owned(), Value::String(Self::resolve(&f.path, absolute, root)));
                obj.insert("type".to_owned(), Value::String(f.file_type.as_str().to_owned()));
                for (k, v) in f.tags.iter() {
                    obj.insert(k.to_owned(), Value::String(v.to_owned()));
                }
                Value::Object(obj)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        let m = Metadata::parse("labExpId=test; sex=M; quality=33;", None);
        Dataset::new(&m, "labExpId").unwrap()
    }

    fn fastq() -> Metadata {
        Metadata::parse("type=fastq;", None)
    }

    #[test]
    fn constructor_drops_file_fields() {
        let m = Metadata::parse("labExpId=test; type=fastq; size=10; sex=M;", None);
        let d = Dataset::new(&m, "labExpId").unwrap();
        assert_eq!(d.id(), "test");
        assert!(d.get("type").is_none());
        assert!(d.get("size").is_none());
        assert_eq!(d.get("sex"), Some("M"));
    }

    #[test]
    fn constructor_requires_id() {
        let m = Metadata::parse("sex=M;", None);
        assert!(matches!(Dataset::new(&m, "labExpId"), Err(Error::MissingId(_))));
    }

    #[test]
    fn pairing_is_sorted() {
        for order in [["/data/test_1.fq", "/data/test_2.fq"], ["/data/test_2.fq", "/data/test_1.fq"]] {
            let mut d = dataset();
            for p in order {
                d.add_file(p, &fastq()).unwrap();
            }
            assert_eq!(d.primary(), Some("/data/test_1.fq"));
            assert_eq!(d.secondary(), Some("/data/test_2.fq"));
            assert!(!d.single_end());
        }
    }

    #[test]
    fn single_file_has_no_secondary() {
        let mut d = dataset();
        d.add_file("/data/test_1.fq", &fastq()).unwrap();
        assert_eq!(d.secondary(), None);
        assert!(d.single_end());
    }

    #[test]
    fn read_type_overrides_file_count() {
        let m = Metadata::parse("labExpId=x; readType=2x76D;", None);
        let mut d = Dataset::new(&m, "labExpId").unwrap();
        d.add_file("/data/x_1.fq", &fastq()).unwrap();
        assert!(!d.single_end());
        assert!(d.stranded());
    }

    #[test]
    fn re_adding_a_path_replaces() {
        let mut d = dataset();
        d.add_file("/data/test_1.fq", &fastq()).unwrap();
        d.add_file("/data/test_1.fq", &Metadata::parse("type=fastq; size=42;", None))
            .unwrap();
        let files = d.files(&FileType::Fastq);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size(), Some("42"));
    }

    #[test]
    fn typed_folder_layout() {
        let mut d = dataset();
        d.add_file("/data/fastq/test_1.fq", &fastq()).unwrap();
        assert!(d.type_folders());
        assert_eq!(d.data_folder(), Some(Path::new("/data")));
        assert_eq!(d.folder("mappings"), Some(PathBuf::from("/data/mappings")));
    }

    #[test]
    fn flat_folder_layout() {
        let mut d = dataset();
        d.add_file("/data/test_1.fq", &fastq()).unwrap();
        assert!(!d.type_folders());
        assert_eq!(d.folder("mappings"), Some(PathBuf::from("/data")));
    }

    #[test]
    fn type_inferred_from_extension() {
        let mut d = dataset();
        d.add_file("/data/test.bam", &Metadata::new()).unwrap();
        assert_eq!(d.files(&FileType::Bam).len(), 1);
        assert!(d.add_file("/data/noext", &Metadata::new()).is_err());
    }

    #[test]
    fn export_lines() {
        let mut d = dataset();
        d.add_file("./data/test_1.fq", &Metadata::parse("type=fastq; view=FastqRd1;", None))
            .unwrap();
        let lines = d.export(false, None, None);
        assert_eq!(
            lines,
            vec!["./data/test_1.fq\tlabExpId=test; sex=M; quality=33; type=fastq; view=FastqRd1;"]
        );

        let abs = d.export(true, Some(Path::new("/project")), None);
        assert!(abs[0].starts_with("/project/data/test_1.fq\t"));
        assert!(d.export(false, None, Some(&["bam"])).is_empty());
    }

    #[test]
    fn metadata_only_export() {
        let d = dataset();
        assert_eq!(d.export(false, None, None), vec![".\tlabExpId=test; sex=M; quality=33;"]);
    }

    #[test]
    fn stats_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello\n").unwrap();
        let (md5, size) = file_stats(&path).unwrap();
        assert_eq!(md5, "b1946ac92492d2347c6235b4d2611184");
        assert_eq!(size, 6);
    }

    #[test]
    fn attr_lookup() {
        let d = dataset();
        assert_eq!(d.attr("sex").unwrap(), "M");
        assert_eq!(d.attr("single_end").unwrap(), "true");
        assert!(matches!(d.attr("tissue"), Err(Error::AttributeNotFound { .. })));
    }
}
