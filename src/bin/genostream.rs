use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use genostream::acquire::{AcquireOptions, AcquisitionManager, AcquisitionResult};
use genostream::aggregate::Aggregator;
use genostream::config::{ConfigLoader, DatasetRequest, ResolvedConfig};
use genostream::domain::{DatasetRef, DatasetSpecifier, RunAccession, TechnologyClass};
use genostream::error::GenoError;
use genostream::metrics;
use genostream::output::JsonOutput;
use genostream::qc::{SystemToolRunner, ToolOrchestrator, load_recorded_runs};
use genostream::registry::{EnaHttpClient, RegistryClient};
use genostream::store::Store;
use genostream::transfer::TransferEngine;

#[derive(Parser)]
#[command(name = "genostream")]
#[command(about = "Resumable acquisition and QC orchestration for public sequencing datasets")]
#[command(version, author)]
struct Cli {
    /// Store root (defaults to ./.genostream)
    #[arg(long, global = true)]
    store: Option<String>,

    /// Config file (defaults to ./genostream.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve and download datasets with resume and integrity checks")]
    Fetch(FetchArgs),
    #[command(about = "Run the matching QC analyzer over local datasets")]
    Qc(QcArgs),
    #[command(about = "Merge recorded QC runs into one consolidated report")]
    Report,
    #[command(about = "Fetch, QC and report in one pass")]
    Run(FetchArgs),
    #[command(about = "List verified local files and available tools")]
    List,
}

#[derive(Args, Clone)]
struct FetchArgs {
    /// technology:accession pair, e.g. short-read:ERR3336960
    specifier: Option<String>,

    #[arg(long)]
    force: bool,
}

#[derive(Args, Clone)]
struct QcArgs {
    /// technology:accession pairs; config datasets when omitted
    specifiers: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(geno) = report.downcast_ref::<GenoError>() {
            return ExitCode::from(map_exit_code(geno));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GenoError) -> u8 {
    match error {
        GenoError::InvalidSpecifier(_)
        | GenoError::InvalidAccession(_)
        | GenoError::UnsupportedTechnology(_)
        | GenoError::MissingConfig
        | GenoError::ConfigRead(_)
        | GenoError::ConfigParse(_)
        | GenoError::DatasetNotFound(_) => 2,
        GenoError::EnaHttp(_)
        | GenoError::EnaStatus { .. }
        | GenoError::ResolutionEmpty(_)
        | GenoError::TransferHttp(_)
        | GenoError::TransferStatus { .. }
        | GenoError::PartialAcquisitionFailure { .. }
        | GenoError::MissingTool(_)
        | GenoError::AggregationIncomplete(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = match &cli.store {
        Some(root) => Store::new_with_root(Utf8PathBuf::from(root)),
        None => Store::new().into_diagnostic()?,
    };
    let cancel = AtomicBool::new(false);

    match cli.command {
        Commands::Fetch(args) => {
            let (requests, config) = load_requests(args.specifier.as_deref(), cli.config.as_deref())?;
            let (_, failure) = run_fetch(&store, &requests, &config, args.force, &cancel)?;
            if let Some(err) = failure {
                return Err(err).into_diagnostic();
            }
            Ok(())
        }
        Commands::Qc(args) => {
            let (requests, config) = if args.specifiers.is_empty() {
                load_requests(None, cli.config.as_deref())?
            } else {
                (
                    parse_specifiers(&args.specifiers)?,
                    load_tuning(cli.config.as_deref())?,
                )
            };
            run_qc(&store, &requests, &config, &cancel)?;
            Ok(())
        }
        Commands::Report => {
            let config = load_tuning(cli.config.as_deref())?;
            run_report(&store, &config, &cancel)?;
            Ok(())
        }
        Commands::Run(args) => {
            let (requests, config) = load_requests(args.specifier.as_deref(), cli.config.as_deref())?;
            let (acquired, failure) = run_fetch(&store, &requests, &config, args.force, &cancel)?;
            if let Some(err) = failure {
                // degrade to the datasets that did verify
                warn!(error = %err, "continuing with verified datasets only");
            }
            let qc_requests: Vec<DatasetRequest> = requests
                .iter()
                .filter(|request| acquired.contains(request.accession.as_str()))
                .cloned()
                .collect();
            run_qc(&store, &qc_requests, &config, &cancel)?;
            run_report(&store, &config, &cancel)?;
            Ok(())
        }
        Commands::List => {
            let verified = store.list_verified().into_diagnostic()?;
            let tools = SystemToolRunner::new().tool_info();
            JsonOutput::print(&ListResult { verified, tools }).into_diagnostic()?;
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct ListResult {
    verified: Vec<genostream::store::VerifiedObject>,
    tools: genostream::qc::ToolInfo,
}

#[derive(Serialize)]
struct FetchReport {
    items: Vec<FetchItem>,
}

#[derive(Serialize)]
struct FetchItem {
    accession: String,
    status: String,
    result: Option<AcquisitionResult>,
    error: Option<String>,
}

fn parse_specifiers(values: &[String]) -> miette::Result<Vec<DatasetRequest>> {
    values
        .iter()
        .map(|value| {
            let spec: DatasetSpecifier = value.parse()?;
            Ok(DatasetRequest {
                accession: spec.accession,
                technology: spec.technology,
                sha256: None,
            })
        })
        .collect::<Result<Vec<_>, GenoError>>()
        .into_diagnostic()
}

/// Dataset requests plus tuning: an explicit specifier wins over the
/// config file's dataset list, but tuning always comes from the config
/// when one is readable.
fn load_requests(
    specifier: Option<&str>,
    config_path: Option<&str>,
) -> miette::Result<(Vec<DatasetRequest>, ResolvedConfig)> {
    let config = load_tuning(config_path)?;
    let requests = match specifier {
        Some(value) => {
            let spec: DatasetSpecifier = value.parse().into_diagnostic()?;
            vec![DatasetRequest {
                accession: spec.accession,
                technology: spec.technology,
                sha256: None,
            }]
        }
        None => {
            if config.datasets.is_empty() {
                return Err(GenoError::MissingConfig).into_diagnostic();
            }
            config.datasets.clone()
        }
    };
    Ok((requests, config))
}

fn load_tuning(config_path: Option<&str>) -> miette::Result<ResolvedConfig> {
    match config_path {
        Some(path) => ConfigLoader::resolve(Some(path)).into_diagnostic(),
        None => match ConfigLoader::resolve(None) {
            Ok(config) => Ok(config),
            Err(GenoError::MissingConfig) => Ok(ResolvedConfig::default()),
            Err(err) => Err(err).into_diagnostic(),
        },
    }
}

fn resolve_datasets(
    requests: &[DatasetRequest],
) -> miette::Result<Vec<DatasetRef>> {
    let registry = EnaHttpClient::new().into_diagnostic()?;
    let mut datasets = Vec::new();
    for request in requests {
        let mut dataset = registry
            .resolve(&request.accession, request.technology)
            .into_diagnostic()?;
        if let Some(sha256) = &request.sha256 {
            // a single pinned digest can only cover a single-file run
            if dataset.objects.len() == 1 {
                dataset.objects[0].expected_sha256 = Some(sha256.clone());
            } else {
                warn!(
                    accession = %dataset.accession,
                    "pinned sha256 ignored for multi-file run"
                );
            }
        }
        datasets.push(dataset);
    }
    Ok(datasets)
}

/// Acquire the requested datasets. Returns the accessions that finished
/// fully verified plus the first failure, so callers decide whether a
/// partial batch is fatal.
fn run_fetch(
    store: &Store,
    requests: &[DatasetRequest],
    config: &ResolvedConfig,
    force: bool,
    cancel: &AtomicBool,
) -> miette::Result<(BTreeSet<String>, Option<GenoError>)> {
    store.ensure_root().into_diagnostic()?;
    let datasets = resolve_datasets(requests)?;
    let engine = TransferEngine::new(&config.transfer).into_diagnostic()?;
    let manager = AcquisitionManager::new(&engine, store, &config.transfer);
    let results = manager.acquire_batch(&datasets, AcquireOptions { force }, cancel);

    let mut verified = BTreeSet::new();
    let mut first_error: Option<GenoError> = None;
    let items: Vec<FetchItem> = results
        .into_iter()
        .map(|(accession, result)| match result {
            Ok(result) => {
                verified.insert(accession.to_string());
                FetchItem {
                    accession: accession.to_string(),
                    status: "verified".to_string(),
                    result: Some(result),
                    error: None,
                }
            }
            Err(err) => {
                let item = FetchItem {
                    accession: accession.to_string(),
                    status: "failed".to_string(),
                    result: None,
                    error: Some(err.to_string()),
                };
                if first_error.is_none() {
                    first_error = Some(err);
                }
                item
            }
        })
        .collect();

    JsonOutput::print(&FetchReport { items }).into_diagnostic()?;
    Ok((verified, first_error))
}

fn run_qc(
    store: &Store,
    requests: &[DatasetRequest],
    config: &ResolvedConfig,
    cancel: &AtomicBool,
) -> miette::Result<()> {
    let runner = SystemToolRunner::new();
    let orchestrator = ToolOrchestrator::new(&runner, store, &config.qc);
    let batch: Vec<(RunAccession, TechnologyClass)> = requests
        .iter()
        .map(|request| (request.accession.clone(), request.technology))
        .collect();
    let runs = orchestrator.run_batch(&batch, cancel);
    JsonOutput::print(&runs).into_diagnostic()?;
    Ok(())
}

fn run_report(
    store: &Store,
    config: &ResolvedConfig,
    cancel: &AtomicBool,
) -> miette::Result<()> {
    let runs = load_recorded_runs(store).into_diagnostic()?;
    let runner = SystemToolRunner::new();
    let aggregator = Aggregator::new(&runner, store, &config.qc);
    let report = aggregator.aggregate(&runs, cancel).into_diagnostic()?;

    let accessions: BTreeSet<&RunAccession> = runs.iter().map(|run| &run.accession).collect();
    for accession in accessions {
        match metrics::write_sampled_series(store, accession, config.qc.sample_cap) {
            Ok(paths) => {
                for path in paths {
                    tracing::debug!(series = %path, "wrote sampled series");
                }
            }
            Err(err) => {
                warn!(accession = %accession, error = %err, "series extraction skipped");
            }
        }
    }

    JsonOutput::print(&report).into_diagnostic()?;
    Ok(())
}
