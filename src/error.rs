use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GenoError {
    #[error("invalid dataset specifier: {0}")]
    InvalidSpecifier(String),

    #[error("invalid run accession: {0}")]
    InvalidAccession(String),

    #[error("unsupported technology class: {0}")]
    UnsupportedTechnology(String),

    #[error("missing config file genostream.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("ENA request failed: {0}")]
    EnaHttp(String),

    #[error("ENA returned status {status}: {message}")]
    EnaStatus { status: u16, message: String },

    #[error("accession {0} resolved to no downloadable files")]
    ResolutionEmpty(String),

    #[error("transfer request failed: {0}")]
    TransferHttp(String),

    #[error("remote returned status {status} for {url}")]
    TransferStatus { status: u16, url: String },

    #[error("acquisition incomplete for {accession}: objects {failed:?} exhausted retries")]
    PartialAcquisitionFailure {
        accession: String,
        failed: Vec<String>,
    },

    #[error("dataset not found locally: {0}")]
    DatasetNotFound(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("report merge failed: {0}")]
    AggregationIncomplete(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation cancelled")]
    Cancelled,
}
