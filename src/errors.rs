pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error parsing \"{string}\" in \"{context}\": {reason}")]
    Parse {
        string: String,
        context: String,
        reason: &'static str,
    },

    #[error("{container} already contains property \"{key}\"")]
    DuplicateKey { container: &'static str, key: String },

    #[error("Key \"{0}\" not found")]
    KeyNotFound(String),

    #[error("Attribute \"{attr}\" not found in dataset \"{dataset}\"")]
    AttributeNotFound { dataset: String, attr: String },

    #[error("Dataset \"{0}\" not found in index")]
    DatasetNotFound(String),

    #[error("Missing dataset id field \"{0}\"")]
    MissingId(String),

    #[error("Unsupported file type \"{0}\"")]
    UnsupportedFileType(String),

    #[error("Locking \"{file}\" failed: {reason}")]
    LockingFailed { file: String, reason: String },

    #[error("Error in job store \"{store}\": {reason}")]
    Store { store: String, reason: String },

    #[error("Error creating pipeline \"{pipeline}\": {reason}")]
    Pipeline { pipeline: String, reason: String },

    #[error("Error building job graph: {0}")]
    Graph(String),

    #[error("Error submitting job \"{job}\": {reason}")]
    Submission { job: String, reason: String },

    #[error("Job \"{job}\" failed: {reason}")]
    Execution { job: String, reason: String },

    #[error("Project error: {0}")]
    Project(String),

    #[error("Error reading or writing \"{file}\": {source}")]
    FileIo {
        file: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Error reading or writing bytes: {0}")]
    BytesIo(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn file_io(file: impl AsRef<std::path::Path>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::FileIo {
            file: file.as_ref().display().to_string(),
            source: Box::new(source),
        }
    }
}

pub fn utf8(b: &[u8]) -> String {
    std::str::from_utf8(b).unwrap_or("invalid utf8").to_owned()
}
