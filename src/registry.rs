use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::domain::{
    DatasetRef, MateRole, RemoteObject, RunAccession, RunMetadata, TechnologyClass,
};
use crate::error::GenoError;

const FILEREPORT_FIELDS: &str = "run_accession,sample_accession,study_accession,scientific_name,\
instrument_platform,instrument_model,library_layout,fastq_ftp,fastq_bytes";

pub trait RegistryClient: Send + Sync {
    fn resolve(
        &self,
        accession: &RunAccession,
        technology: TechnologyClass,
    ) -> Result<DatasetRef, GenoError>;
}

/// Resolves run accessions through the ENA portal file report, which also
/// mirrors NCBI SRA runs.
#[derive(Clone)]
pub struct EnaHttpClient {
    client: Client,
    base_url: String,
}

impl EnaHttpClient {
    pub fn new() -> Result<Self, GenoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("genostream/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GenoError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GenoError::EnaHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://www.ebi.ac.uk/ena/portal/api/filereport".to_string(),
        })
    }

    pub fn new_with_base_url(base_url: String) -> Result<Self, GenoError> {
        let mut this = Self::new()?;
        this.base_url = base_url;
        Ok(this)
    }

    fn send_with_retries(&self, accession: &RunAccession) -> Result<String, GenoError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = self
                .client
                .get(&self.base_url)
                .query(&[
                    ("accession", accession.as_str()),
                    ("result", "read_run"),
                    ("fields", FILEREPORT_FIELDS),
                    ("format", "tsv"),
                ])
                .send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    if !resp.status().is_success() {
                        let message = resp
                            .text()
                            .unwrap_or_else(|_| "ENA request failed".to_string());
                        return Err(GenoError::EnaStatus { status, message });
                    }
                    return resp.text().map_err(|err| GenoError::EnaHttp(err.to_string()));
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(GenoError::EnaHttp(err.to_string()));
                }
            }
        }
    }
}

impl RegistryClient for EnaHttpClient {
    fn resolve(
        &self,
        accession: &RunAccession,
        technology: TechnologyClass,
    ) -> Result<DatasetRef, GenoError> {
        let body = self.send_with_retries(accession)?;
        let dataset = parse_filereport(accession, technology, &body)?;
        debug!(
            accession = %dataset.accession,
            objects = dataset.objects.len(),
            platform = %dataset.metadata.instrument_platform,
            "resolved run"
        );
        Ok(dataset)
    }
}

/// Parse the two-line TSV file report into a resolved dataset.
pub fn parse_filereport(
    accession: &RunAccession,
    technology: TechnologyClass,
    body: &str,
) -> Result<DatasetRef, GenoError> {
    let mut lines = body.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| GenoError::ResolutionEmpty(accession.to_string()))?
        .split('\t')
        .collect();
    let row: Vec<&str> = lines
        .next()
        .ok_or_else(|| GenoError::ResolutionEmpty(accession.to_string()))?
        .split('\t')
        .collect();

    let field = |name: &str| -> String {
        header
            .iter()
            .position(|column| *column == name)
            .and_then(|index| row.get(index))
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    };

    let fastq_ftp = field("fastq_ftp");
    if fastq_ftp.is_empty() {
        return Err(GenoError::ResolutionEmpty(accession.to_string()));
    }
    let urls: Vec<String> = fastq_ftp
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(ftp_to_https)
        .collect();
    let sizes: Vec<Option<u64>> = field("fastq_bytes")
        .split(';')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect();

    let mut objects = Vec::new();
    for (index, url) in urls.iter().enumerate() {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .ok_or_else(|| GenoError::ResolutionEmpty(accession.to_string()))?;
        let role = classify_role(url, index, technology);
        let expected_size = sizes.get(index).copied().flatten();
        objects.push(RemoteObject::new(
            file_name,
            url.clone(),
            role,
            expected_size,
        ));
    }

    Ok(DatasetRef {
        accession: accession.clone(),
        registry: accession.registry(),
        technology,
        metadata: RunMetadata {
            sample_accession: field("sample_accession"),
            study_accession: field("study_accession"),
            scientific_name: field("scientific_name"),
            instrument_platform: field("instrument_platform"),
            instrument_model: field("instrument_model"),
            library_layout: field("library_layout"),
        },
        objects,
    })
}

/// ENA file reports list bare FTP host paths; range requests go over https.
pub fn ftp_to_https(url_or_path: &str) -> String {
    let mut s = url_or_path.trim().to_string();
    if let Some(rest) = s.strip_prefix("ftp://") {
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_prefix("http://") {
        return format!("https://{rest}");
    }
    if s.starts_with("https://") {
        return s;
    }
    format!("https://{s}")
}

fn classify_role(url: &str, index: usize, technology: TechnologyClass) -> MateRole {
    if technology == TechnologyClass::LongRead {
        return MateRole::Single;
    }
    let lower = url.to_lowercase();
    if lower.contains("_1.fastq") || lower.contains("_r1") {
        MateRole::R1
    } else if lower.contains("_2.fastq") || lower.contains("_r2") {
        MateRole::R2
    } else if index == 0 {
        MateRole::R1
    } else {
        MateRole::R2
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE_REPORT: &str = "run_accession\tsample_accession\tstudy_accession\tscientific_name\tinstrument_platform\tinstrument_model\tlibrary_layout\tfastq_ftp\tfastq_bytes\n\
ERR3336960\tSAMEA5634101\tPRJEB32062\tStaphylococcus aureus\tILLUMINA\tHiSeq X Ten\tPAIRED\tftp.sra.ebi.ac.uk/vol1/fastq/ERR333/000/ERR3336960/ERR3336960_1.fastq.gz;ftp.sra.ebi.ac.uk/vol1/fastq/ERR333/000/ERR3336960/ERR3336960_2.fastq.gz\t1367113144;\n";

    #[test]
    fn ftp_paths_rewritten() {
        assert_eq!(
            ftp_to_https("ftp.sra.ebi.ac.uk/vol1/x.gz"),
            "https://ftp.sra.ebi.ac.uk/vol1/x.gz"
        );
        assert_eq!(
            ftp_to_https("ftp://ftp.sra.ebi.ac.uk/vol1/x.gz"),
            "https://ftp.sra.ebi.ac.uk/vol1/x.gz"
        );
        assert_eq!(ftp_to_https("https://host/x.gz"), "https://host/x.gz");
    }

    #[test]
    fn parse_paired_report() {
        let acc: RunAccession = "ERR3336960".parse().unwrap();
        let dataset =
            parse_filereport(&acc, TechnologyClass::ShortRead, SAMPLE_REPORT).unwrap();
        assert_eq!(dataset.objects.len(), 2);
        assert_eq!(dataset.objects[0].role, MateRole::R1);
        assert_eq!(dataset.objects[1].role, MateRole::R2);
        assert_eq!(dataset.objects[0].expected_size, Some(1367113144));
        // missing byte counts degrade to unknown size
        assert_eq!(dataset.objects[1].expected_size, None);
        assert_eq!(dataset.metadata.instrument_platform, "ILLUMINA");
        assert!(dataset.objects[0].url.starts_with("https://"));
    }

    #[test]
    fn empty_report_is_resolution_error() {
        let acc: RunAccession = "ERR3336960".parse().unwrap();
        let err = parse_filereport(&acc, TechnologyClass::ShortRead, "header_only\n")
            .unwrap_err();
        assert_matches!(err, GenoError::ResolutionEmpty(_));
    }

    #[test]
    fn long_read_role_single() {
        let report = SAMPLE_REPORT.replace("PAIRED", "SINGLE");
        let acc: RunAccession = "ERR3336960".parse().unwrap();
        let dataset = parse_filereport(&acc, TechnologyClass::LongRead, &report).unwrap();
        assert!(dataset
            .objects
            .iter()
            .all(|object| object.role == MateRole::Single));
    }
}
