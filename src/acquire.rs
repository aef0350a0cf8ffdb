use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TransferTuning;
use crate::domain::{DatasetRef, RemoteObject, RunAccession, TransferState};
use crate::error::GenoError;
use crate::manifest::{Manifest, ManifestRow};
use crate::metrics;
use crate::store::{Store, VerifiedObject};
use crate::transfer::{FetchOutcome, Fetcher, sha256_file};

#[derive(Debug, Clone, Serialize)]
pub struct ObjectResult {
    pub file_name: String,
    pub state: TransferState,
    pub path: Option<Utf8PathBuf>,
    pub attempts: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionResult {
    pub accession: RunAccession,
    pub objects: Vec<ObjectResult>,
}

impl AcquisitionResult {
    pub fn all_verified(&self) -> bool {
        self.objects
            .iter()
            .all(|object| object.state == TransferState::Verified)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.objects
            .iter()
            .filter(|object| object.state != TransferState::Verified)
            .map(|object| object.file_name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Re-download even when a verified copy is already on disk.
    pub force: bool,
}

/// Drives the transfer engine per remote object: retry with exponential
/// backoff, resume after interruption, restart from zero after an
/// integrity failure, and skip objects already verified on disk.
pub struct AcquisitionManager<'a, F: Fetcher> {
    fetcher: &'a F,
    store: &'a Store,
    tuning: &'a TransferTuning,
    manifest: Mutex<Manifest>,
}

impl<'a, F: Fetcher> AcquisitionManager<'a, F> {
    pub fn new(fetcher: &'a F, store: &'a Store, tuning: &'a TransferTuning) -> Self {
        let manifest = Mutex::new(Manifest::new(store.manifest_path()));
        Self {
            fetcher,
            store,
            tuning,
            manifest,
        }
    }

    pub fn acquire(
        &self,
        dataset: &DatasetRef,
        options: AcquireOptions,
        cancel: &AtomicBool,
    ) -> Result<AcquisitionResult, GenoError> {
        let mut results = self.acquire_batch(std::slice::from_ref(dataset), options, cancel);
        results
            .pop()
            .map(|(_, result)| result)
            .unwrap_or_else(|| Err(GenoError::Filesystem("empty batch".to_string())))
    }

    /// Acquire several datasets with one worker pool shared across all of
    /// their objects. Every object reaches a terminal state (or stays
    /// paused under cancellation) before this returns.
    pub fn acquire_batch(
        &self,
        datasets: &[DatasetRef],
        options: AcquireOptions,
        cancel: &AtomicBool,
    ) -> Vec<(RunAccession, Result<AcquisitionResult, GenoError>)> {
        let mut queue = VecDeque::new();
        for (dataset_index, dataset) in datasets.iter().enumerate() {
            for object_index in 0..dataset.objects.len() {
                queue.push_back((dataset_index, object_index));
            }
        }
        let task_count = queue.len();
        let queue = Mutex::new(queue);
        let results: Vec<Mutex<Vec<Option<ObjectResult>>>> = datasets
            .iter()
            .map(|dataset| Mutex::new(vec![None; dataset.objects.len()]))
            .collect();

        let worker_count = self.tuning.max_concurrent.min(task_count.max(1));
        thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| {
                    loop {
                        let task = {
                            let mut queue =
                                queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                            queue.pop_front()
                        };
                        let Some((dataset_index, object_index)) = task else {
                            break;
                        };
                        let dataset = &datasets[dataset_index];
                        let object = &dataset.objects[object_index];
                        let result = self.transfer_object(dataset, object, options, cancel);
                        let mut slot = results[dataset_index]
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        slot[object_index] = Some(result);
                    }
                });
            }
        });

        datasets
            .iter()
            .zip(results)
            .map(|(dataset, slot)| {
                let objects: Vec<ObjectResult> = slot
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .into_iter()
                    .flatten()
                    .collect();
                let result = AcquisitionResult {
                    accession: dataset.accession.clone(),
                    objects,
                };
                let outcome = if result.all_verified() {
                    Ok(result)
                } else if cancel.load(Ordering::Relaxed) {
                    Err(GenoError::Cancelled)
                } else {
                    Err(GenoError::PartialAcquisitionFailure {
                        accession: dataset.accession.to_string(),
                        failed: result.failed_names(),
                    })
                };
                (dataset.accession.clone(), outcome)
            })
            .collect()
    }

    fn transfer_object(
        &self,
        dataset: &DatasetRef,
        object: &RemoteObject,
        options: AcquireOptions,
        cancel: &AtomicBool,
    ) -> ObjectResult {
        let accession = &dataset.accession;
        let final_path = self.store.object_path(accession, &object.file_name);
        let partial_path = self.store.partial_path(accession, &object.file_name);
        let marker_path = self.store.verified_marker_path(accession, &object.file_name);

        if !options.force && Store::exists(&marker_path) && Store::exists(&final_path) {
            debug!(accession = %accession, file = %object.file_name, "already verified, skipping");
            let bytes = std::fs::metadata(final_path.as_std_path())
                .map(|meta| meta.len())
                .unwrap_or_default();
            return ObjectResult {
                file_name: object.file_name.clone(),
                state: TransferState::Verified,
                path: Some(final_path),
                attempts: 0,
                bytes,
            };
        }
        if options.force {
            for stale in [&final_path, &partial_path, &marker_path] {
                if Store::exists(stale) {
                    let _ = std::fs::remove_file(stale.as_std_path());
                }
            }
        }

        let mut state = TransferState::Pending;
        let mut attempts = 0u32;
        let mut bytes = 0u64;
        while attempts < self.tuning.max_attempts {
            if cancel.load(Ordering::Relaxed) {
                state = TransferState::Paused;
                break;
            }
            attempts += 1;
            state = TransferState::InProgress;
            let resume_offset = std::fs::metadata(partial_path.as_std_path())
                .map(|meta| meta.len())
                .unwrap_or(0);
            if resume_offset > 0 {
                info!(
                    accession = %accession,
                    file = %object.file_name,
                    resume_offset,
                    attempt = attempts,
                    "resuming transfer"
                );
            }

            match self
                .fetcher
                .fetch(object, &partial_path, resume_offset, cancel)
            {
                Ok(FetchOutcome::Complete { bytes_written }) => {
                    match self.finalize(dataset, object, &partial_path, &final_path, &marker_path)
                    {
                        Ok(()) => {
                            state = TransferState::Verified;
                            bytes = bytes_written;
                        }
                        Err(err) => {
                            warn!(accession = %accession, file = %object.file_name, error = %err, "finalize failed");
                            state = TransferState::Failed;
                        }
                    }
                    break;
                }
                Ok(FetchOutcome::Interrupted { bytes_written }) => {
                    bytes = bytes_written;
                    state = TransferState::Paused;
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    if attempts >= self.tuning.max_attempts {
                        state = TransferState::Failed;
                        break;
                    }
                    self.backoff(attempts);
                }
                Ok(FetchOutcome::IntegrityMismatch) => {
                    // the whole partial is suspect; next attempt starts over
                    warn!(
                        accession = %accession,
                        file = %object.file_name,
                        attempt = attempts,
                        "integrity mismatch, restarting from zero"
                    );
                    let _ = std::fs::remove_file(partial_path.as_std_path());
                    bytes = 0;
                    state = TransferState::Paused;
                    if attempts >= self.tuning.max_attempts {
                        state = TransferState::Failed;
                        break;
                    }
                    self.backoff(attempts);
                }
                Err(err) => {
                    warn!(accession = %accession, file = %object.file_name, error = %err, "transfer failed");
                    state = TransferState::Failed;
                    break;
                }
            }
        }
        if !state.is_terminal() && !cancel.load(Ordering::Relaxed) {
            state = TransferState::Failed;
        }

        ObjectResult {
            file_name: object.file_name.clone(),
            state,
            path: (state == TransferState::Verified).then_some(final_path),
            attempts,
            bytes,
        }
    }

    fn finalize(
        &self,
        dataset: &DatasetRef,
        object: &RemoteObject,
        partial_path: &camino::Utf8Path,
        final_path: &camino::Utf8Path,
        marker_path: &camino::Utf8Path,
    ) -> Result<(), GenoError> {
        Store::promote_partial(partial_path, final_path)?;
        let size = std::fs::metadata(final_path.as_std_path())
            .map(|meta| meta.len())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        let sha256 = sha256_file(final_path)?;
        let verified_at = chrono::Utc::now().to_rfc3339();
        Store::write_json_atomic(
            marker_path,
            &VerifiedObject {
                accession: dataset.accession.to_string(),
                file_name: object.file_name.clone(),
                size,
                sha256: sha256.clone(),
                source_url: object.url.clone(),
                verified_at,
            },
        )?;

        let reads = match metrics::count_reads(final_path) {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(file = %final_path, error = %err, "read count failed");
                None
            }
        };
        let row = ManifestRow::new(
            object.file_name.clone(),
            object.role,
            dataset.accession.clone(),
            &dataset.metadata,
            object.url.clone(),
            size,
            reads,
            sha256,
        );
        let manifest = self
            .manifest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        manifest.append(&row)?;
        info!(accession = %dataset.accession, file = %object.file_name, size, "object verified");
        Ok(())
    }

    fn backoff(&self, attempt: u32) {
        let shift = attempt.saturating_sub(1).min(10);
        let delay = self.tuning.backoff_base * (1u32 << shift);
        thread::sleep(delay);
    }
}
