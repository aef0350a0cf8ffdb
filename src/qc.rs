use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::QcTuning;
use crate::domain::{QcOutcome, QcRun, RunAccession, TechnologyClass};
use crate::error::GenoError;
use crate::store::Store;

/// The two analyzer families in scope: FastQC for short reads, NanoPlot
/// for long reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analyzer {
    Fastqc,
    Nanoplot,
}

impl Analyzer {
    pub fn for_technology(technology: TechnologyClass) -> Self {
        match technology {
            TechnologyClass::ShortRead => Analyzer::Fastqc,
            TechnologyClass::LongRead => Analyzer::Nanoplot,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Analyzer::Fastqc => "fastqc",
            Analyzer::Nanoplot => "nanoplot",
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Analyzer::Fastqc => "fastqc",
            Analyzer::Nanoplot => "NanoPlot",
        }
    }

    fn command_args(&self, inputs: &[Utf8PathBuf], out_dir: &Utf8Path) -> Vec<String> {
        match self {
            Analyzer::Fastqc => {
                let mut args: Vec<String> =
                    inputs.iter().map(|path| path.to_string()).collect();
                args.extend(["-o".to_string(), out_dir.to_string(), "-q".to_string()]);
                args
            }
            Analyzer::Nanoplot => {
                let mut args = vec!["--fastq".to_string()];
                args.extend(inputs.iter().map(|path| path.to_string()));
                args.extend(["-o".to_string(), out_dir.to_string()]);
                args
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExit {
    Completed(i32),
    TimedOut,
    Cancelled,
}

/// Seam between the orchestrator and external processes. `run_tool` fails
/// with `MissingTool` when the program is not on PATH.
pub trait ToolRunner: Send + Sync {
    fn run_tool(
        &self,
        program: &str,
        args: &[String],
        log_dir: &Utf8Path,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<ToolExit, GenoError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub fastqc: Option<String>,
    pub nanoplot: Option<String>,
    pub multiqc: Option<String>,
}

/// Spawns analyzers found on PATH, redirecting their output to log files
/// and enforcing a wall-clock budget.
#[derive(Debug, Default, Clone)]
pub struct SystemToolRunner;

impl SystemToolRunner {
    pub fn new() -> Self {
        Self
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            fastqc: find_in_path("fastqc").and_then(|path| tool_version(&path, &["--version"])),
            nanoplot: find_in_path("NanoPlot")
                .and_then(|path| tool_version(&path, &["--version"])),
            multiqc: find_in_path("multiqc").and_then(|path| tool_version(&path, &["--version"])),
        }
    }
}

impl ToolRunner for SystemToolRunner {
    fn run_tool(
        &self,
        program: &str,
        args: &[String],
        log_dir: &Utf8Path,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<ToolExit, GenoError> {
        let program_path =
            find_in_path(program).ok_or_else(|| GenoError::MissingTool(program.to_string()))?;
        Store::ensure_dir(log_dir)?;
        let stdout = fs::File::create(log_dir.join("stdout.log").as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        let stderr = fs::File::create(log_dir.join("stderr.log").as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;

        let mut child = Command::new(&program_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| GenoError::Filesystem(format!("spawn {program}: {err}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            if cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ToolExit::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(ToolExit::Completed(status.code().unwrap_or(-1)));
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(ToolExit::TimedOut);
                    }
                    thread::sleep(Duration::from_millis(200));
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GenoError::Filesystem(format!("wait {program}: {err}")));
                }
            }
        }
    }
}

/// Dispatches the analyzer matching a dataset's technology class and
/// records one `QcRun` per invocation. Failures stay local to their run.
pub struct ToolOrchestrator<'a, R: ToolRunner> {
    runner: &'a R,
    store: &'a Store,
    tuning: &'a QcTuning,
}

impl<'a, R: ToolRunner> ToolOrchestrator<'a, R> {
    pub fn new(runner: &'a R, store: &'a Store, tuning: &'a QcTuning) -> Self {
        Self {
            runner,
            store,
            tuning,
        }
    }

    pub fn run(
        &self,
        accession: &RunAccession,
        technology: TechnologyClass,
        cancel: &AtomicBool,
    ) -> Result<Vec<QcRun>, GenoError> {
        let inputs = self.dataset_inputs(accession)?;
        let analyzer = Analyzer::for_technology(technology);
        let run = self.run_analyzer(accession, analyzer, &inputs, cancel);
        self.record(&run)?;
        Ok(vec![run])
    }

    /// Run QC for several datasets with bounded concurrency. A dataset
    /// whose run fails (or whose files are missing) is recorded, never
    /// fatal to the batch.
    pub fn run_batch(
        &self,
        requests: &[(RunAccession, TechnologyClass)],
        cancel: &AtomicBool,
    ) -> Vec<QcRun> {
        let queue: Mutex<VecDeque<usize>> = Mutex::new((0..requests.len()).collect());
        let collected: Mutex<Vec<QcRun>> = Mutex::new(Vec::new());

        let worker_count = self.tuning.max_concurrent.min(requests.len().max(1));
        thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| {
                    loop {
                        let index = {
                            let mut queue =
                                queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                            queue.pop_front()
                        };
                        let Some(index) = index else {
                            break;
                        };
                        let (accession, technology) = &requests[index];
                        let runs = match self.run(accession, *technology, cancel) {
                            Ok(runs) => runs,
                            Err(err) => {
                                warn!(accession = %accession, error = %err, "qc run not started");
                                let analyzer = Analyzer::for_technology(*technology);
                                vec![QcRun {
                                    accession: accession.clone(),
                                    analyzer: analyzer.name().to_string(),
                                    exit_code: None,
                                    output_dir: self.store.qc_dir(accession, analyzer.name()),
                                    outcome: QcOutcome::NotRun,
                                }]
                            }
                        };
                        let mut collected = collected
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        collected.extend(runs);
                    }
                });
            }
        });

        collected
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_analyzer(
        &self,
        accession: &RunAccession,
        analyzer: Analyzer,
        inputs: &[Utf8PathBuf],
        cancel: &AtomicBool,
    ) -> QcRun {
        let output_dir = self.store.qc_dir(accession, analyzer.name());
        let args = analyzer.command_args(inputs, &output_dir);
        info!(accession = %accession, analyzer = analyzer.name(), "starting analyzer");

        let (outcome, exit_code) = match self.runner.run_tool(
            analyzer.program(),
            &args,
            &output_dir,
            self.tuning.tool_timeout,
            cancel,
        ) {
            Ok(ToolExit::Completed(0)) => (QcOutcome::Ok, Some(0)),
            Ok(ToolExit::Completed(code)) => {
                warn!(accession = %accession, analyzer = analyzer.name(), code, "analyzer failed");
                (
                    QcOutcome::ToolError {
                        timed_out: false,
                        cancelled: false,
                    },
                    Some(code),
                )
            }
            Ok(ToolExit::TimedOut) => {
                warn!(accession = %accession, analyzer = analyzer.name(), "analyzer timed out");
                (
                    QcOutcome::ToolError {
                        timed_out: true,
                        cancelled: false,
                    },
                    None,
                )
            }
            Ok(ToolExit::Cancelled) => (
                QcOutcome::ToolError {
                    timed_out: false,
                    cancelled: true,
                },
                None,
            ),
            Err(GenoError::MissingTool(tool)) => {
                warn!(accession = %accession, tool, "analyzer not installed, skipping");
                (QcOutcome::NotRun, None)
            }
            Err(err) => {
                warn!(accession = %accession, analyzer = analyzer.name(), error = %err, "analyzer invocation failed");
                (
                    QcOutcome::ToolError {
                        timed_out: false,
                        cancelled: false,
                    },
                    None,
                )
            }
        };

        QcRun {
            accession: accession.clone(),
            analyzer: analyzer.name().to_string(),
            exit_code,
            output_dir,
            outcome,
        }
    }

    /// Record the run next to its raw output so the aggregator can locate
    /// it without re-running anything.
    fn record(&self, run: &QcRun) -> Result<(), GenoError> {
        let path = run.output_dir.join("run.json");
        Store::write_json_atomic(&path, run)
    }

    fn dataset_inputs(&self, accession: &RunAccession) -> Result<Vec<Utf8PathBuf>, GenoError> {
        let inputs = self.store.fastq_files(accession)?;
        if inputs.is_empty() {
            return Err(GenoError::DatasetNotFound(accession.to_string()));
        }
        Ok(inputs)
    }
}

/// Load every recorded `QcRun` under the store's qc tree.
pub fn load_recorded_runs(store: &Store) -> Result<Vec<QcRun>, GenoError> {
    let qc_root = store.root().join("qc");
    if !Store::exists(&qc_root) {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    let accessions = fs::read_dir(qc_root.as_std_path())
        .map_err(|err| GenoError::Filesystem(err.to_string()))?;
    for accession_entry in accessions {
        let accession_entry =
            accession_entry.map_err(|err| GenoError::Filesystem(err.to_string()))?;
        if !accession_entry.path().is_dir() {
            continue;
        }
        let analyzers = fs::read_dir(accession_entry.path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        for analyzer_entry in analyzers {
            let analyzer_entry =
                analyzer_entry.map_err(|err| GenoError::Filesystem(err.to_string()))?;
            let run_path = analyzer_entry.path().join("run.json");
            if !run_path.exists() {
                continue;
            }
            let utf8 = Utf8PathBuf::from_path_buf(run_path)
                .map_err(|_| GenoError::Filesystem("non-utf8 qc path".to_string()))?;
            runs.push(Store::read_json(&utf8)?);
        }
    }
    Ok(runs)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}
