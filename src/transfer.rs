use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::TransferTuning;
use crate::domain::RemoteObject;
use crate::error::GenoError;

const STREAM_BUF_SIZE: usize = 64 * 1024;
const HASH_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Result of one fetch attempt. `bytes_written` is the confirmed byte count
/// on disk after the attempt, i.e. the resume offset for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete { bytes_written: u64 },
    Interrupted { bytes_written: u64 },
    IntegrityMismatch,
}

/// Seam between the acquisition manager and the network. The production
/// implementation is [`TransferEngine`]; tests substitute scripted fetchers.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        object: &RemoteObject,
        destination: &Utf8Path,
        resume_offset: u64,
        cancel: &AtomicBool,
    ) -> Result<FetchOutcome, GenoError>;
}

/// Streams one remote object to disk over ranged requests.
///
/// The engine only ever writes or extends the destination file; discarding
/// a corrupt partial is the acquisition manager's decision.
pub struct TransferEngine {
    client: Client,
    progress_interval: u64,
}

impl TransferEngine {
    pub fn new(tuning: &TransferTuning) -> Result<Self, GenoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("genostream/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GenoError::Filesystem(err.to_string()))?,
        );
        // identity keeps byte offsets stable across resumed attempts
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(tuning.attempt_timeout)
            .build()
            .map_err(|err| GenoError::TransferHttp(err.to_string()))?;
        Ok(Self {
            client,
            progress_interval: tuning.progress_interval_bytes,
        })
    }

    fn open_destination(
        &self,
        destination: &Utf8Path,
        resume_offset: u64,
    ) -> Result<Option<File>, GenoError> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(destination.as_std_path())
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        let on_disk = file
            .metadata()
            .map_err(|err| GenoError::Filesystem(err.to_string()))?
            .len();
        if on_disk < resume_offset {
            // shorter than the confirmed offset: the partial cannot be trusted
            return Ok(None);
        }
        // drop any bytes past the confirmed offset before appending
        file.set_len(resume_offset)
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        Ok(Some(file))
    }
}

impl Fetcher for TransferEngine {
    fn fetch(
        &self,
        object: &RemoteObject,
        destination: &Utf8Path,
        resume_offset: u64,
        cancel: &AtomicBool,
    ) -> Result<FetchOutcome, GenoError> {
        let Some(mut file) = self.open_destination(destination, resume_offset)? else {
            warn!(url = %object.url, resume_offset, "partial shorter than confirmed offset");
            return Ok(FetchOutcome::IntegrityMismatch);
        };

        let mut request = self.client.get(&object.url);
        if resume_offset > 0 {
            request = request.header(RANGE, format!("bytes={resume_offset}-"));
        }
        let response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                // connection-level failure before any byte moved: resumable
                debug!(url = %object.url, error = %err, "transfer attempt failed to connect");
                return Ok(FetchOutcome::Interrupted {
                    bytes_written: resume_offset,
                });
            }
        };

        let status = response.status();
        let mut offset = resume_offset;
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(FetchOutcome::IntegrityMismatch);
        }
        if is_retryable_status(status.as_u16()) {
            return Ok(FetchOutcome::Interrupted {
                bytes_written: resume_offset,
            });
        }
        if !status.is_success() {
            return Err(GenoError::TransferStatus {
                status: status.as_u16(),
                url: object.url.clone(),
            });
        }
        if resume_offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            // server ignored the range request; restart the stream from zero
            debug!(url = %object.url, "range ignored by server, restarting from zero");
            file.set_len(0)
                .map_err(|err| GenoError::Filesystem(err.to_string()))?;
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;

        let mut reader = response;
        let mut buf = [0u8; STREAM_BUF_SIZE];
        let mut since_progress = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                file.flush()
                    .map_err(|err| GenoError::Filesystem(err.to_string()))?;
                return Ok(FetchOutcome::Interrupted {
                    bytes_written: offset,
                });
            }
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    // mid-stream loss: keep what we have, caller resumes
                    debug!(url = %object.url, bytes = offset, error = %err, "transfer interrupted");
                    file.flush()
                        .map_err(|err| GenoError::Filesystem(err.to_string()))?;
                    return Ok(FetchOutcome::Interrupted {
                        bytes_written: offset,
                    });
                }
            };
            file.write_all(&buf[..read])
                .map_err(|err| GenoError::Filesystem(err.to_string()))?;
            offset += read as u64;
            since_progress += read as u64;
            if since_progress >= self.progress_interval {
                debug!(url = %object.url, bytes = offset, "transfer progress");
                since_progress = 0;
            }
        }
        file.flush()
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        drop(file);

        if let Some(expected) = object.expected_size {
            if offset != expected {
                warn!(
                    url = %object.url,
                    expected,
                    actual = offset,
                    "size mismatch after transfer"
                );
                return Ok(FetchOutcome::IntegrityMismatch);
            }
        }
        if let Some(expected) = &object.expected_sha256 {
            // a resumed range cannot be trusted once the whole-file digest
            // fails, so the digest always covers the full local file
            let actual = sha256_file(destination)?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(url = %object.url, expected, actual, "checksum mismatch after transfer");
                return Ok(FetchOutcome::IntegrityMismatch);
            }
        }

        Ok(FetchOutcome::Complete {
            bytes_written: offset,
        })
    }
}

/// SHA-256 of a whole file, hex-encoded, streamed in 8 MiB blocks.
pub fn sha256_file(path: &Utf8Path) -> Result<String, GenoError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| GenoError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|err| GenoError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
