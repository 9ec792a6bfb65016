use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid year-month key: {0}")]
    InvalidYearMonth(String),

    #[error("invalid search area: {0}")]
    InvalidSearchArea(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("missing config file kira-sdm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    ConfigInvalid(String),

    #[error("missing credentials: {0}")]
    #[diagnostic(help("export GBIF_USER, GBIF_PWD and GBIF_EMAIL before running downloads"))]
    MissingCredentials(String),

    #[error("WoRMS request failed: {0}")]
    WormsHttp(String),

    #[error("WoRMS returned status {status}: {message}")]
    WormsStatus { status: u16, message: String },

    #[error("page fetch at offset {offset} failed after retry: {message}")]
    #[diagnostic(help("pages before this offset are on disk; rerun with --resume"))]
    PageFetch { offset: u64, message: String },

    #[error("GBIF request failed: {0}")]
    GbifHttp(String),

    #[error("GBIF returned status {status}: {message}")]
    GbifStatus { status: u16, message: String },

    #[error("name matching chunk starting at {start} failed: {message}")]
    ChunkFailed { start: usize, message: String },

    #[error("download batch {batch} failed: {message}")]
    DownloadJob { batch: usize, message: String },

    #[error("{failed} of {total} download batches failed")]
    #[diagnostic(help("rerun the listed batches with `kira-sdm download --batch <index>`"))]
    IncompleteDownload { failed: usize, total: usize },

    #[error("year-month {year_month}: expected {expected} environmental layers, found {found}")]
    LayerCount {
        year_month: String,
        expected: usize,
        found: usize,
    },

    #[error("year-month {year_month}: duplicate layer {layer}")]
    DuplicateLayer { year_month: String, layer: String },

    #[error("failed to read grid {path}: {message}")]
    GridRead { path: PathBuf, message: String },

    #[error("{failed} of {total} backbone chunks failed")]
    #[diagnostic(help(
        "failed query ranges are listed in backbone/failures.json; rerun `kira-sdm match`"
    ))]
    IncompleteMatch { failed: usize, total: usize },

    #[error("{failed} year-month partitions failed to join")]
    #[diagnostic(help("rerun the listed months with `kira-sdm join --month <YYYYMM>`"))]
    IncompleteJoin { failed: usize },

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
