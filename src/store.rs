use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::domain::RunAccession;
use crate::error::GenoError;

/// On-disk layout for everything the pipeline persists. Paths are
/// partitioned per dataset and per analyzer so no two workers ever write
/// the same file.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, GenoError> {
        let cwd = std::env::current_dir().map_err(|err| GenoError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".genostream"))
            .map_err(|_| GenoError::Filesystem("invalid store path".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn data_dir(&self, accession: &RunAccession) -> Utf8PathBuf {
        self.root.join("data").join(accession.as_str())
    }

    pub fn object_path(&self, accession: &RunAccession, file_name: &str) -> Utf8PathBuf {
        self.data_dir(accession).join(file_name)
    }

    /// Resumable partial next to the final object path.
    pub fn partial_path(&self, accession: &RunAccession, file_name: &str) -> Utf8PathBuf {
        self.data_dir(accession).join(format!("{file_name}.part"))
    }

    pub fn verified_marker_path(&self, accession: &RunAccession, file_name: &str) -> Utf8PathBuf {
        self.data_dir(accession)
            .join(format!("{file_name}.verified.json"))
    }

    pub fn qc_dir(&self, accession: &RunAccession, analyzer: &str) -> Utf8PathBuf {
        self.root.join("qc").join(accession.as_str()).join(analyzer)
    }

    pub fn report_dir(&self) -> Utf8PathBuf {
        self.root.join("report")
    }

    pub fn merge_input_dir(&self) -> Utf8PathBuf {
        self.report_dir().join("input")
    }

    pub fn summary_path(&self) -> Utf8PathBuf {
        self.report_dir().join("summary.json")
    }

    pub fn series_path(&self, accession: &RunAccession, metric: &str) -> Utf8PathBuf {
        self.report_dir()
            .join("series")
            .join(format!("{}.{metric}.json", accession.as_str()))
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join("manifest.tsv")
    }

    pub fn ensure_root(&self) -> Result<(), GenoError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), GenoError> {
        fs::create_dir_all(path.as_std_path()).map_err(|err| GenoError::Filesystem(err.to_string()))
    }

    pub fn exists(path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), GenoError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, GenoError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| GenoError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| GenoError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), GenoError> {
        let parent = path
            .parent()
            .ok_or_else(|| GenoError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("genostream")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| GenoError::Filesystem(err.to_string()))?;
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Promote a completed partial to its final name.
    pub fn promote_partial(partial: &Utf8Path, dest: &Utf8Path) -> Result<(), GenoError> {
        fs::rename(partial.as_std_path(), dest.as_std_path())
            .map_err(|err| GenoError::Filesystem(format!("promote {partial}: {err}")))
    }

    pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), GenoError> {
        fs::create_dir_all(dest.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        for entry in walk_dir(source.as_std_path())? {
            let relative = entry.strip_prefix(source.as_std_path()).unwrap();
            let target = dest.as_std_path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|err| GenoError::Filesystem(err.to_string()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| GenoError::Filesystem(err.to_string()))?;
                }
                fs::copy(entry, &target).map_err(|err| GenoError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Fastq files of a dataset currently on disk, sorted by name.
    /// Partials and sidecars are excluded.
    pub fn fastq_files(&self, accession: &RunAccession) -> Result<Vec<Utf8PathBuf>, GenoError> {
        let data_dir = self.data_dir(accession);
        if !data_dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let entries = fs::read_dir(data_dir.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| GenoError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name.ends_with(".fastq.gz") || name.ends_with(".fastq") || name.ends_with(".fq.gz")
            {
                let utf8 = Utf8PathBuf::from_path_buf(path)
                    .map_err(|_| GenoError::Filesystem("non-utf8 dataset path".to_string()))?;
                files.push(utf8);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Verified datasets currently on disk, by accession directory name.
    pub fn list_verified(&self) -> Result<Vec<VerifiedObject>, GenoError> {
        let data_root = self.root.join("data");
        if !data_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for path in walk_dir(data_root.as_std_path())? {
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(".verified.json"))
                    .unwrap_or(false)
            {
                let content = fs::read_to_string(&path)
                    .map_err(|err| GenoError::Filesystem(err.to_string()))?;
                let record: VerifiedObject = serde_json::from_str(&content)
                    .map_err(|err| GenoError::Filesystem(err.to_string()))?;
                out.push(record);
            }
        }
        Ok(out)
    }
}

/// Sidecar written next to a verified object. Its presence short-circuits
/// re-acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedObject {
    pub accession: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    pub source_url: String,
    pub verified_at: String,
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, GenoError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| GenoError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| GenoError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
