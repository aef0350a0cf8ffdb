use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use genostream::acquire::{AcquireOptions, AcquisitionManager};
use genostream::config::TransferTuning;
use genostream::domain::{DatasetRef, MateRole, RemoteObject, RunMetadata, TechnologyClass};
use genostream::error::GenoError;
use genostream::store::Store;
use genostream::transfer::{FetchOutcome, Fetcher};

/// One scripted behavior per fetch call, keyed by object file name.
enum Step {
    /// Append the bytes and report completion.
    Finish(&'static [u8]),
    /// Append the bytes, then drop the connection.
    Stall(&'static [u8]),
    /// Report a checksum/size failure.
    Mismatch,
}

struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: AtomicU32,
}

impl ScriptedFetcher {
    fn new(scripts: Vec<(&str, Vec<Step>)>) -> Self {
        let scripts = scripts
            .into_iter()
            .map(|(name, steps)| (name.to_string(), steps.into_iter().collect()))
            .collect();
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicU32::new(0),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(
        &self,
        object: &RemoteObject,
        destination: &Utf8Path,
        resume_offset: u64,
        _cancel: &AtomicBool,
    ) -> Result<FetchOutcome, GenoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts
            .get_mut(&object.file_name)
            .unwrap_or_else(|| panic!("unexpected fetch of {}", object.file_name));
        let step = steps.pop_front().expect("script exhausted");

        let mut append = |bytes: &[u8]| {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent.as_std_path()).unwrap();
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(destination.as_std_path())
                .unwrap();
            file.write_all(bytes).unwrap();
        };

        match step {
            Step::Finish(bytes) => {
                append(bytes);
                Ok(FetchOutcome::Complete {
                    bytes_written: resume_offset + bytes.len() as u64,
                })
            }
            Step::Stall(bytes) => {
                append(bytes);
                Ok(FetchOutcome::Interrupted {
                    bytes_written: resume_offset + bytes.len() as u64,
                })
            }
            Step::Mismatch => {
                let _ = std::fs::remove_file(destination.as_std_path());
                Ok(FetchOutcome::IntegrityMismatch)
            }
        }
    }
}

fn fast_tuning() -> TransferTuning {
    TransferTuning {
        max_attempts: 4,
        backoff_base: Duration::from_millis(1),
        max_concurrent: 2,
        attempt_timeout: Duration::from_secs(1),
        progress_interval_bytes: 64 * 1024,
    }
}

fn dataset(accession: &str, files: &[&str]) -> DatasetRef {
    let accession: genostream::domain::RunAccession = accession.parse().unwrap();
    DatasetRef {
        registry: accession.registry(),
        accession,
        technology: TechnologyClass::ShortRead,
        metadata: RunMetadata::default(),
        objects: files
            .iter()
            .enumerate()
            .map(|(index, name)| {
                RemoteObject::new(
                    name.to_string(),
                    format!("https://example.org/{name}"),
                    if index == 0 { MateRole::R1 } else { MateRole::R2 },
                    None,
                )
            })
            .collect(),
    }
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Store::new_with_root(root))
}

#[test]
fn resumed_transfer_matches_single_pass() {
    let (_temp, store) = temp_store();
    let tuning = fast_tuning();
    let cancel = AtomicBool::new(false);

    let fetcher = ScriptedFetcher::new(vec![
        ("resumed.fastq.gz", vec![Step::Stall(b"hello "), Step::Finish(b"world")]),
        ("onepass.fastq.gz", vec![Step::Finish(b"hello world")]),
    ]);
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let dataset = dataset("ERR3336960", &["resumed.fastq.gz", "onepass.fastq.gz"]);

    let result = manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap();
    assert!(result.all_verified());

    let accession = &dataset.accession;
    let resumed = std::fs::read(store.object_path(accession, "resumed.fastq.gz").as_std_path())
        .unwrap();
    let onepass = std::fs::read(store.object_path(accession, "onepass.fastq.gz").as_std_path())
        .unwrap();
    assert_eq!(resumed, onepass);
    assert_eq!(resumed, b"hello world");
}

#[test]
fn checksum_failures_then_restart_success() {
    let (_temp, store) = temp_store();
    let tuning = fast_tuning();
    let cancel = AtomicBool::new(false);

    // one object fails verification twice and succeeds from scratch on the
    // third attempt; its sibling succeeds immediately
    let fetcher = ScriptedFetcher::new(vec![
        (
            "flaky_1.fastq.gz",
            vec![Step::Mismatch, Step::Mismatch, Step::Finish(b"payload-a")],
        ),
        ("clean_2.fastq.gz", vec![Step::Finish(b"payload-b")]),
    ]);
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let dataset = dataset("ERR3336960", &["flaky_1.fastq.gz", "clean_2.fastq.gz"]);

    let result = manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap();

    assert!(result.all_verified());
    let flaky = result
        .objects
        .iter()
        .find(|object| object.file_name == "flaky_1.fastq.gz")
        .unwrap();
    assert_eq!(flaky.attempts, 3);
    let clean = result
        .objects
        .iter()
        .find(|object| object.file_name == "clean_2.fastq.gz")
        .unwrap();
    assert_eq!(clean.attempts, 1);
}

#[test]
fn exhausted_retries_is_partial_failure() {
    let (_temp, store) = temp_store();
    let tuning = TransferTuning {
        max_attempts: 2,
        ..fast_tuning()
    };
    let cancel = AtomicBool::new(false);

    let fetcher = ScriptedFetcher::new(vec![
        ("bad_1.fastq.gz", vec![Step::Stall(b"x"), Step::Stall(b"y")]),
        ("good_2.fastq.gz", vec![Step::Finish(b"fine")]),
    ]);
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let dataset = dataset("ERR3336960", &["bad_1.fastq.gz", "good_2.fastq.gz"]);

    let err = manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap_err();
    assert_matches!(
        err,
        GenoError::PartialAcquisitionFailure { ref failed, .. } if failed == &vec!["bad_1.fastq.gz".to_string()]
    );

    // the verified sibling is kept on disk
    let good = store.object_path(&dataset.accession, "good_2.fastq.gz");
    assert!(good.as_std_path().exists());
    // the failed object's partial survives for a later resume
    let partial = store.partial_path(&dataset.accession, "bad_1.fastq.gz");
    assert!(partial.as_std_path().exists());
}

#[test]
fn verified_objects_are_not_refetched() {
    let (_temp, store) = temp_store();
    let tuning = fast_tuning();
    let cancel = AtomicBool::new(false);

    let fetcher = ScriptedFetcher::new(vec![(
        "only.fastq.gz",
        vec![Step::Finish(b"payload")],
    )]);
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let dataset = dataset("SRR0140660", &["only.fastq.gz"]);

    manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap();
    assert_eq!(fetcher.call_count(), 1);

    // second acquire is a no-op: the script has no steps left, so any
    // fetch would panic
    let result = manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap();
    assert!(result.all_verified());
    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(result.objects[0].attempts, 0);
}

#[test]
fn cancellation_keeps_partial_state() {
    let (_temp, store) = temp_store();
    let tuning = fast_tuning();
    let cancel = AtomicBool::new(false);

    struct CancellingFetcher;
    impl Fetcher for CancellingFetcher {
        fn fetch(
            &self,
            _object: &RemoteObject,
            destination: &Utf8Path,
            resume_offset: u64,
            cancel: &AtomicBool,
        ) -> Result<FetchOutcome, GenoError> {
            std::fs::create_dir_all(destination.parent().unwrap().as_std_path()).unwrap();
            std::fs::write(destination.as_std_path(), b"partial").unwrap();
            // batch-level stop arrives mid-transfer
            cancel.store(true, Ordering::SeqCst);
            Ok(FetchOutcome::Interrupted {
                bytes_written: resume_offset + 7,
            })
        }
    }

    let fetcher = CancellingFetcher;
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let dataset = dataset("ERR3336961", &["ont.fastq.gz"]);

    let err = manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap_err();
    assert_matches!(err, GenoError::Cancelled);

    let partial = store.partial_path(&dataset.accession, "ont.fastq.gz");
    assert!(partial.as_std_path().exists());
}

#[test]
fn manifest_row_written_on_verify() {
    let (_temp, store) = temp_store();
    let tuning = fast_tuning();
    let cancel = AtomicBool::new(false);

    let fetcher = ScriptedFetcher::new(vec![(
        "run.fastq",
        vec![Step::Finish(b"@r1\nACGT\n+\nIIII\n")],
    )]);
    let manager = AcquisitionManager::new(&fetcher, &store, &tuning);
    let mut dataset = dataset("ERR3336960", &["run.fastq"]);
    dataset.metadata.scientific_name = "Staphylococcus aureus".to_string();

    manager
        .acquire(&dataset, AcquireOptions::default(), &cancel)
        .unwrap();

    let manifest = std::fs::read_to_string(store.manifest_path().as_std_path()).unwrap();
    let lines: Vec<&str> = manifest.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].contains("run.fastq"));
    assert!(lines[1].contains("Staphylococcus aureus"));
    // one fastq record counted
    assert!(lines[1].split('\t').nth(8) == Some("1"));

    // verified sidecar records the digest of the final file
    let verified = store.list_verified().unwrap();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].file_name, "run.fastq");
    assert_eq!(verified[0].size, 16);
}
