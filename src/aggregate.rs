use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::QcTuning;
use crate::domain::{QcOutcome, QcRun};
use crate::error::GenoError;
use crate::qc::{ToolExit, ToolRunner};
use crate::store::Store;

/// Per-dataset slice of the consolidated report. `metrics_available` is
/// the explicit marker distinguishing "no successful analyzer" from a
/// silently missing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub analyzers: BTreeMap<String, QcOutcome>,
    pub metrics_available: bool,
}

/// Consolidated report over one batch. Keyed maps keep serialization
/// independent of QC completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub datasets: BTreeMap<String, DatasetSummary>,
    /// Directory holding the merge program's output, when it ran.
    pub merged_report: Option<Utf8PathBuf>,
}

impl AggregateReport {
    pub fn dataset(&self, accession: &str) -> Option<&DatasetSummary> {
        self.datasets.get(accession)
    }
}

/// Collects finished QC runs into one report and delegates the cross-tool
/// merge to an external program over an assembled input directory.
pub struct Aggregator<'a, R: ToolRunner> {
    runner: &'a R,
    store: &'a Store,
    tuning: &'a QcTuning,
}

impl<'a, R: ToolRunner> Aggregator<'a, R> {
    pub fn new(runner: &'a R, store: &'a Store, tuning: &'a QcTuning) -> Self {
        Self {
            runner,
            store,
            tuning,
        }
    }

    pub fn aggregate(
        &self,
        runs: &[QcRun],
        cancel: &AtomicBool,
    ) -> Result<AggregateReport, GenoError> {
        let mut datasets: BTreeMap<String, DatasetSummary> = BTreeMap::new();
        for run in runs {
            let entry = datasets
                .entry(run.accession.to_string())
                .or_insert_with(|| DatasetSummary {
                    analyzers: BTreeMap::new(),
                    metrics_available: false,
                });
            entry.analyzers.insert(run.analyzer.clone(), run.outcome);
            if run.outcome.is_ok() {
                entry.metrics_available = true;
            }
        }

        let successful: Vec<&QcRun> = runs.iter().filter(|run| run.outcome.is_ok()).collect();
        let merged_report = if successful.is_empty() {
            info!("no successful qc runs, skipping merge step");
            None
        } else {
            self.assemble_merge_input(&successful)?;
            self.run_merge(cancel)?
        };

        let report = AggregateReport {
            datasets,
            merged_report,
        };
        Store::write_json_atomic(&self.store.summary_path(), &report)?;
        Ok(report)
    }

    /// Lay out `report/input/<accession>/<analyzer>` from the successful
    /// runs' raw outputs — the merge program's expected input shape.
    fn assemble_merge_input(&self, runs: &[&QcRun]) -> Result<(), GenoError> {
        let input_root = self.store.merge_input_dir();
        for run in runs {
            let dest = input_root
                .join(run.accession.as_str())
                .join(&run.analyzer);
            Store::copy_dir_recursive(&run.output_dir, &dest)?;
        }
        Ok(())
    }

    fn run_merge(&self, cancel: &AtomicBool) -> Result<Option<Utf8PathBuf>, GenoError> {
        let input_root = self.store.merge_input_dir();
        let report_dir = self.store.report_dir();
        let args = vec![
            input_root.to_string(),
            "-o".to_string(),
            report_dir.to_string(),
            "-f".to_string(),
        ];
        match self.runner.run_tool(
            "multiqc",
            &args,
            &report_dir.join("merge-logs"),
            self.tuning.tool_timeout,
            cancel,
        ) {
            Ok(ToolExit::Completed(0)) => Ok(Some(report_dir)),
            Ok(ToolExit::Completed(code)) => Err(GenoError::AggregationIncomplete(format!(
                "merge program exited with status {code}; per-tool outputs kept for retry"
            ))),
            Ok(ToolExit::TimedOut) => Err(GenoError::AggregationIncomplete(
                "merge program timed out; per-tool outputs kept for retry".to_string(),
            )),
            Ok(ToolExit::Cancelled) => Err(GenoError::AggregationIncomplete(
                "merge cancelled; per-tool outputs kept for retry".to_string(),
            )),
            Err(GenoError::MissingTool(tool)) => {
                // merge is emulated: the summary JSON is the consolidated artifact
                warn!(tool, "merge program not installed, emitting summary only");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

