use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DatasetSpecifier, RunAccession, TechnologyClass};
use crate::error::GenoError;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub transfer: Option<TransferSettings>,
    #[serde(default)]
    pub qc: Option<QcSettings>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub accession: String,
    pub technology: TechnologyClass,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Raw transfer tunables as they appear in `genostream.json`. Every field
/// is optional; `TransferTuning` documents the defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TransferSettings {
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub attempt_timeout_secs: Option<u64>,
    pub progress_interval_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct QcSettings {
    pub tool_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub sample_cap: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub accession: RunAccession,
    pub technology: TechnologyClass,
    pub sha256: Option<String>,
}

/// Resolved transfer policy.
///
/// Defaults: 4 attempts per object, 500 ms backoff base (doubling per
/// attempt), 4 concurrent transfers per batch, 120 s per-attempt timeout,
/// progress updates every 8 MiB.
#[derive(Debug, Clone)]
pub struct TransferTuning {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_concurrent: usize,
    pub attempt_timeout: Duration,
    pub progress_interval_bytes: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            max_concurrent: 4,
            attempt_timeout: Duration::from_secs(120),
            progress_interval_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Resolved QC policy.
///
/// Defaults: 900 s wall-clock budget per analyzer invocation, 2 concurrent
/// invocations, 2000-point cap for sampled series.
#[derive(Debug, Clone)]
pub struct QcTuning {
    pub tool_timeout: Duration,
    pub max_concurrent: usize,
    pub sample_cap: usize,
}

impl Default for QcTuning {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(900),
            max_concurrent: 2,
            sample_cap: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub datasets: Vec<DatasetRequest>,
    pub transfer: TransferTuning,
    pub qc: QcTuning,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            datasets: Vec::new(),
            transfer: TransferTuning::default(),
            qc: QcTuning::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, GenoError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("genostream.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(GenoError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| GenoError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| GenoError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GenoError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let datasets = config
            .datasets
            .into_iter()
            .map(|entry| match entry {
                DatasetEntry::Shorthand(value) => {
                    let spec: DatasetSpecifier = value.parse()?;
                    Ok(DatasetRequest {
                        accession: spec.accession,
                        technology: spec.technology,
                        sha256: None,
                    })
                }
                DatasetEntry::Detailed(obj) => Ok(DatasetRequest {
                    accession: obj.accession.parse()?,
                    technology: obj.technology,
                    sha256: obj.sha256,
                }),
            })
            .collect::<Result<Vec<_>, GenoError>>()?;

        let transfer = resolve_transfer(config.transfer.unwrap_or_default());
        let qc = resolve_qc(config.qc.unwrap_or_default());

        Ok(ResolvedConfig {
            schema_version,
            datasets,
            transfer,
            qc,
        })
    }
}

fn resolve_transfer(settings: TransferSettings) -> TransferTuning {
    let defaults = TransferTuning::default();
    TransferTuning {
        max_attempts: settings.max_attempts.unwrap_or(defaults.max_attempts).max(1),
        backoff_base: settings
            .backoff_base_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base),
        max_concurrent: settings
            .max_concurrent
            .unwrap_or(defaults.max_concurrent)
            .max(1),
        attempt_timeout: settings
            .attempt_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.attempt_timeout),
        progress_interval_bytes: settings
            .progress_interval_bytes
            .unwrap_or(defaults.progress_interval_bytes)
            .max(64 * 1024),
    }
}

fn resolve_qc(settings: QcSettings) -> QcTuning {
    let defaults = QcTuning::default();
    QcTuning {
        tool_timeout: settings
            .tool_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.tool_timeout),
        max_concurrent: settings
            .max_concurrent
            .unwrap_or(defaults.max_concurrent)
            .max(1),
        sample_cap: settings.sample_cap.unwrap_or(defaults.sample_cap).max(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            schema_version: None,
            datasets: vec![
                DatasetEntry::Shorthand("short-read:ERR3336960".to_string()),
                DatasetEntry::Detailed(DatasetEntryObject {
                    accession: "ERR3336961".to_string(),
                    technology: TechnologyClass::LongRead,
                    sha256: Some("ab".repeat(32)),
                }),
            ],
            transfer: None,
            qc: None,
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.datasets.len(), 2);
        assert_eq!(resolved.datasets[0].technology, TechnologyClass::ShortRead);
        assert!(resolved.datasets[1].sha256.is_some());
        assert_eq!(resolved.transfer.max_attempts, 4);
        assert_eq!(resolved.qc.max_concurrent, 2);
    }

    #[test]
    fn transfer_overrides_clamped() {
        let tuning = resolve_transfer(TransferSettings {
            max_attempts: Some(0),
            backoff_base_ms: Some(100),
            max_concurrent: Some(0),
            attempt_timeout_secs: None,
            progress_interval_bytes: Some(1),
        });
        assert_eq!(tuning.max_attempts, 1);
        assert_eq!(tuning.max_concurrent, 1);
        assert_eq!(tuning.backoff_base, Duration::from_millis(100));
        assert_eq!(tuning.progress_interval_bytes, 64 * 1024);
    }
}
