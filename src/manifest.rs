use std::fs::OpenOptions;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{MateRole, RunAccession, RunMetadata};
use crate::error::GenoError;

const HEADER: &str = "filename\trole\trun_accession\tsample_accession\tplatform\torganism\tsource_url\tbytes\treads\tsha256\tcreated_utc";

/// One provenance row per verified file. Columns mirror the fields a
/// downstream reviewer needs to trace a local file back to its run.
#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub filename: String,
    pub role: MateRole,
    pub accession: RunAccession,
    pub sample_accession: String,
    pub platform: String,
    pub organism: String,
    pub source_url: String,
    pub bytes: u64,
    pub reads: Option<u64>,
    pub sha256: String,
    pub created_utc: String,
}

impl ManifestRow {
    pub fn new(
        filename: String,
        role: MateRole,
        accession: RunAccession,
        metadata: &RunMetadata,
        source_url: String,
        bytes: u64,
        reads: Option<u64>,
        sha256: String,
    ) -> Self {
        Self {
            filename,
            role,
            accession,
            sample_accession: metadata.sample_accession.clone(),
            platform: metadata.instrument_platform.clone(),
            organism: metadata.scientific_name.clone(),
            source_url,
            bytes,
            reads,
            sha256,
            created_utc: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Append-only TSV manifest. Single-writer discipline: callers serialize
/// appends themselves (the acquisition manager holds it behind a lock).
#[derive(Debug, Clone)]
pub struct Manifest {
    path: Utf8PathBuf,
}

impl Manifest {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn append(&self, row: &ManifestRow) -> Result<(), GenoError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        }
        let write_header = !self.path.as_std_path().exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        if write_header {
            writeln!(file, "{HEADER}").map_err(|err| GenoError::Filesystem(err.to_string()))?;
        }
        writeln!(file, "{}", format_row(row)).map_err(|err| GenoError::Filesystem(err.to_string()))
    }
}

fn format_row(row: &ManifestRow) -> String {
    let reads = row
        .reads
        .map(|count| count.to_string())
        .unwrap_or_default();
    [
        tsv_field(&row.filename),
        row.role.to_string(),
        row.accession.to_string(),
        tsv_field(&row.sample_accession),
        tsv_field(&row.platform),
        tsv_field(&row.organism),
        tsv_field(&row.source_url),
        row.bytes.to_string(),
        reads,
        row.sha256.clone(),
        row.created_utc.clone(),
    ]
    .join("\t")
}

fn tsv_field(value: &str) -> String {
    value.replace(['\t', '\n'], " ")
}
