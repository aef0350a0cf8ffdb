use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::domain::RunAccession;
use crate::error::GenoError;
use crate::sample;
use crate::store::Store;

/// Per-read statistics extracted from a fastq stream: one entry per read,
/// in file order.
#[derive(Debug, Default, Clone)]
pub struct ReadMetrics {
    pub lengths: Vec<f64>,
    pub mean_qualities: Vec<f64>,
    pub gc_percents: Vec<f64>,
}

impl ReadMetrics {
    pub fn record_count(&self) -> u64 {
        self.lengths.len() as u64
    }
}

fn open_reader(path: &Utf8Path) -> Result<Box<dyn BufRead>, GenoError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| GenoError::Filesystem(format!("open {path}: {err}")))?;
    let gz = path
        .file_name()
        .map(|name| name.ends_with(".gz") || name.ends_with(".gzip"))
        .unwrap_or(false);
    let reader: Box<dyn Read> = if gz {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Stream a fastq(.gz) file and collect per-read length, mean Phred
/// quality (ASCII-33) and GC percentage. Every read is visited; bounding
/// for visualization happens downstream in the sampling reducer.
pub fn scan_fastq(path: &Utf8Path) -> Result<ReadMetrics, GenoError> {
    let mut reader = open_reader(path)?;
    let mut metrics = ReadMetrics::default();
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| GenoError::Filesystem(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }

        let mut sequence = String::new();
        let mut plus = String::new();
        let mut quality = String::new();
        for target in [&mut sequence, &mut plus, &mut quality] {
            if reader
                .read_line(target)
                .map_err(|err| GenoError::Filesystem(format!("read {path}: {err}")))?
                == 0
            {
                // truncated trailing record, drop it
                return Ok(metrics);
            }
        }
        let sequence = sequence.trim_end();
        let quality = quality.trim_end();
        let length = sequence.len();
        if length == 0 {
            continue;
        }

        metrics.lengths.push(length as f64);

        let quality_sum: u64 = quality
            .bytes()
            .map(|byte| u64::from(byte.saturating_sub(33)))
            .sum();
        let quality_len = quality.len().max(1);
        metrics
            .mean_qualities
            .push(quality_sum as f64 / quality_len as f64);

        let gc = sequence
            .bytes()
            .filter(|byte| matches!(byte, b'G' | b'C' | b'g' | b'c'))
            .count();
        metrics.gc_percents.push(gc as f64 / length as f64 * 100.0);
    }
    Ok(metrics)
}

/// Extract metric series from a dataset's local fastq files and persist
/// bounded samples of them for the visualization collaborator. Mates are
/// concatenated in file order; positions are read indices in scan order.
pub fn write_sampled_series(
    store: &Store,
    accession: &RunAccession,
    cap: usize,
) -> Result<Vec<Utf8PathBuf>, GenoError> {
    let files = store.fastq_files(accession)?;
    if files.is_empty() {
        return Err(GenoError::DatasetNotFound(accession.to_string()));
    }
    let mut combined = ReadMetrics::default();
    for file in &files {
        let metrics = scan_fastq(file)?;
        combined.lengths.extend(metrics.lengths);
        combined.mean_qualities.extend(metrics.mean_qualities);
        combined.gc_percents.extend(metrics.gc_percents);
    }
    debug!(accession = %accession, reads = combined.record_count(), "sampling metric series");

    let mut written = Vec::new();
    for (metric, series) in [
        ("length", &combined.lengths),
        ("quality", &combined.mean_qualities),
        ("gc", &combined.gc_percents),
    ] {
        let sampled = sample::sample(series, cap);
        let path = store.series_path(accession, metric);
        Store::write_json_atomic(&path, &sampled)?;
        written.push(path);
    }
    Ok(written)
}

/// Count fastq records without collecting metrics.
pub fn count_reads(path: &Utf8Path) -> Result<u64, GenoError> {
    let mut reader = open_reader(path)?;
    let mut lines = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| GenoError::Filesystem(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }
        lines += 1;
    }
    Ok(lines / 4)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use camino::Utf8PathBuf;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    const FASTQ: &str = "@read1\nACGT\n+\nIIII\n@read2\nGGCCGG\n+\n!!!!!!\n";

    #[test]
    fn scan_plain_fastq() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("reads.fastq")).unwrap();
        std::fs::write(path.as_std_path(), FASTQ).unwrap();

        let metrics = scan_fastq(&path).unwrap();
        assert_eq!(metrics.record_count(), 2);
        assert_eq!(metrics.lengths, vec![4.0, 6.0]);
        // 'I' is Phred 40, '!' is Phred 0
        assert_eq!(metrics.mean_qualities[0], 40.0);
        assert_eq!(metrics.mean_qualities[1], 0.0);
        assert_eq!(metrics.gc_percents[0], 50.0);
        assert_eq!(metrics.gc_percents[1], 100.0);
    }

    #[test]
    fn scan_gz_fastq() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("reads.fastq.gz")).unwrap();
        let file = std::fs::File::create(path.as_std_path()).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(FASTQ.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let metrics = scan_fastq(&path).unwrap();
        assert_eq!(metrics.record_count(), 2);
        assert_eq!(count_reads(&path).unwrap(), 2);
    }

    #[test]
    fn sampled_series_written_per_metric() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_root(root);
        let accession: RunAccession = "ERR3336960".parse().unwrap();

        let data_dir = store.data_dir(&accession);
        std::fs::create_dir_all(data_dir.as_std_path()).unwrap();
        std::fs::write(data_dir.join("reads.fastq").as_std_path(), FASTQ).unwrap();

        let written = write_sampled_series(&store, &accession, 100).unwrap();
        assert_eq!(written.len(), 3);
        let lengths: crate::sample::SampledSeries =
            Store::read_json(&store.series_path(&accession, "length")).unwrap();
        assert_eq!(lengths.source_len, 2);
        assert_eq!(lengths.points[0].value, 4.0);
        assert_eq!(lengths.points[1].value, 6.0);
    }

    #[test]
    fn truncated_record_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("reads.fastq")).unwrap();
        std::fs::write(path.as_std_path(), "@read1\nACGT\n+\nIIII\n@read2\nACGT\n").unwrap();

        let metrics = scan_fastq(&path).unwrap();
        assert_eq!(metrics.record_count(), 1);
    }
}
