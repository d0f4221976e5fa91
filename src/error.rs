use thiserror::Error;

/// Errors raised by a [`crate::fetch::Fetcher`] while talking to a source site.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unsupported source URL: {0}")]
    UnsupportedSource(String),
    #[error("malformed story URL: {0}")]
    MalformedUrl(String),
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("chapter is gone (404): {0}")]
    ChapterGone(String),
    #[error("could not parse page at {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Errors raised while cleaning or filtering chapter content. Both transformations are
/// best-effort by design (see `SPEC_FULL.md` C2/C3), so this type exists mostly to carry
/// warnings through `tracing`, not to abort a run.
#[derive(Error, Debug)]
pub enum CleanError {
    #[error("malformed sentence-removal pattern, skipped: {0}")]
    BadPattern(String),
}

/// Errors surfaced by the reconciliation step. These are all considered programmer errors /
/// data corruption: a well-formed manifest and progress record should never trigger them.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("duplicate chapter_url in manifest: {0}")]
    DuplicateUrl(String),
}

/// Per-task failure returned by the download worker pool. Never fatal to the run; it is
/// recorded into the chapter's `error_info` and the chapter is marked `failed`.
#[derive(Error, Debug)]
pub enum DownloadTaskError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("chapter body was empty after cleaning")]
    EmptyAfterClean,
    #[error("could not write chapter file: {0}")]
    Filesystem(#[from] std::io::Error),
    #[error("run was cancelled")]
    Cancelled,
}

/// Errors that abort a run outright: state integrity can no longer be guaranteed.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("could not save progress record for {slug}: {source}")]
    ProgressSave {
        slug: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no fetcher recognizes this URL: {0}")]
    UnsupportedSource(String),
    #[error("could not start download worker pool: {0}")]
    PoolInit(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Problems loading or normalizing `config/settings.ini`. Never fatal on their own: the
/// caller substitutes the documented default and continues (see SPEC_FULL.md A3).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from `ProgressStore` / `StoryIndex` persistence.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path} as JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not atomically write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a [`crate::cloud::CloudStore`] backend.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("network error talking to cloud backend: {0}")]
    Network(String),
    #[error("authentication with cloud backend failed: {0}")]
    Auth(String),
    #[error("local file not found for upload: {0}")]
    LocalFileMissing(String),
}

/// Errors from the EPUB builder.
#[derive(Error, Debug)]
pub enum EpubError {
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Xml(#[from] xml::writer::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no chapters to include in volume {0}")]
    EmptyVolume(usize),
}
