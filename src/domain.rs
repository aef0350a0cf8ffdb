use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GenoError;

/// Run accession in an INSDC registry (e.g. `ERR3336960`, `SRR014966`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunAccession(String);

fn accession_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(SRR|ERR|DRR)[0-9]{6,}$").unwrap())
}

impl RunAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Home registry, derived from the accession prefix.
    pub fn registry(&self) -> Registry {
        if self.0.starts_with("SRR") {
            Registry::Ncbi
        } else {
            Registry::Ena
        }
    }
}

impl fmt::Display for RunAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunAccession {
    type Err = GenoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !accession_pattern().is_match(&normalized) {
            return Err(GenoError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Ncbi,
    Ena,
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registry::Ncbi => write!(f, "ncbi"),
            Registry::Ena => write!(f, "ena"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TechnologyClass {
    ShortRead,
    LongRead,
}

impl fmt::Display for TechnologyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TechnologyClass::ShortRead => write!(f, "short-read"),
            TechnologyClass::LongRead => write!(f, "long-read"),
        }
    }
}

impl FromStr for TechnologyClass {
    type Err = GenoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "short-read" | "short" | "illumina" => Ok(TechnologyClass::ShortRead),
            "long-read" | "long" | "nanopore" | "pacbio" => Ok(TechnologyClass::LongRead),
            other => Err(GenoError::UnsupportedTechnology(other.to_string())),
        }
    }
}

/// `technology:accession` pair as written on the command line or in config,
/// e.g. `short-read:ERR3336960`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpecifier {
    pub technology: TechnologyClass,
    pub accession: RunAccession,
}

impl FromStr for DatasetSpecifier {
    type Err = GenoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (technology, accession) = trimmed
            .split_once(':')
            .ok_or_else(|| GenoError::InvalidSpecifier(value.to_string()))?;
        Ok(Self {
            technology: technology.parse()?,
            accession: accession.parse()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferState {
    Pending,
    InProgress,
    Paused,
    Verified,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Verified | TransferState::Failed)
    }
}

/// Mate role of a fastq file within a run. Paired short-read layouts carry
/// R1/R2; everything else is a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MateRole {
    #[serde(rename = "SHORT_R1")]
    R1,
    #[serde(rename = "SHORT_R2")]
    R2,
    #[serde(rename = "LONG_READ")]
    Single,
}

impl fmt::Display for MateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MateRole::R1 => write!(f, "SHORT_R1"),
            MateRole::R2 => write!(f, "SHORT_R2"),
            MateRole::Single => write!(f, "LONG_READ"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteObject {
    pub file_name: String,
    pub url: String,
    pub role: MateRole,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
    pub state: TransferState,
}

impl RemoteObject {
    pub fn new(file_name: String, url: String, role: MateRole, expected_size: Option<u64>) -> Self {
        Self {
            file_name,
            url,
            role,
            expected_size,
            expected_sha256: None,
            state: TransferState::Pending,
        }
    }
}

/// Registry metadata describing the sequencing run behind an accession.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub sample_accession: String,
    pub study_accession: String,
    pub scientific_name: String,
    pub instrument_platform: String,
    pub instrument_model: String,
    pub library_layout: String,
}

/// A resolved dataset: accession plus the remote files backing it.
/// Built once by the registry client; object transfer state is driven by
/// the acquisition manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRef {
    pub accession: RunAccession,
    pub registry: Registry,
    pub technology: TechnologyClass,
    pub metadata: RunMetadata,
    pub objects: Vec<RemoteObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum QcOutcome {
    Ok,
    ToolError { timed_out: bool, cancelled: bool },
    NotRun,
}

impl QcOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, QcOutcome::Ok)
    }
}

/// One analyzer invocation for one dataset. Immutable once the outcome is
/// recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcRun {
    pub accession: RunAccession,
    pub analyzer: String,
    pub exit_code: Option<i32>,
    pub output_dir: Utf8PathBuf,
    pub outcome: QcOutcome,
}
