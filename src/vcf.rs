// vcf.rs

use crate::error::{PipelineError, Result};
use crate::layout::ensure_parent;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Fixed columns kept from every VCF, in addition to the sample columns.
pub const FIXED_COLUMNS: [&str; 5] = ["CHROM", "POS", "REF", "ALT", "INFO"];

/// VCF sample columns start after CHROM..FORMAT.
const FIRST_SAMPLE_COLUMN: usize = 9;

/// A line equal to this ends the stream early without being an error.
const CLOSING_SENTINEL: &str = "##";

/// Opens a gzip (or multi-member bgzip) text file for buffered line reading.
pub fn open_gzip_text(path: &Path) -> Result<BufReader<MultiGzDecoder<File>>> {
    let file = File::open(path)?;
    Ok(BufReader::new(MultiGzDecoder::new(file)))
}

/// Creates a gzip text file, creating parent directories as needed.
pub fn create_gzip_text(path: &Path) -> Result<GzEncoder<BufWriter<File>>> {
    ensure_parent(path)?;
    let file = File::create(path)?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

/// Sample identifiers to keep, read from the first column of a TSV with a header row.
#[derive(Debug, Clone)]
pub struct SampleAllowList {
    names: Vec<String>,
}

impl SampleAllowList {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn from_tsv(path: &Path) -> Result<Self> {
        info!("Reading sample allow-list from {}", path.display());
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let mut names = Vec::new();
        for record in reader.records() {
            let record = record?;
            if let Some(name) = record.get(0) {
                names.push(name.to_string());
            }
        }
        info!("Sample allow-list holds {} identifiers.", names.len());
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Streams a VCF text source and yields, per data line, the selected columns
/// in header order. One pass; reopen the file to read it again.
pub struct VcfColumnReader<R: BufRead> {
    reader: R,
    source: PathBuf,
    columns: Vec<String>,
    indices: Vec<usize>,
    line_number: usize,
    line_buffer: String,
    finished: bool,
}

impl VcfColumnReader<BufReader<MultiGzDecoder<File>>> {
    pub fn open(path: &Path, allow_list: Option<&SampleAllowList>) -> Result<Self> {
        debug!("Opening VCF: {}", path.display());
        Self::from_reader(open_gzip_text(path)?, path, allow_list)
    }
}

impl<R: BufRead> VcfColumnReader<R> {
    pub fn from_reader(
        mut reader: R,
        source: &Path,
        allow_list: Option<&SampleAllowList>,
    ) -> Result<Self> {
        let mut line_buffer = String::new();
        let mut line_number = 0usize;

        let header_names = loop {
            line_buffer.clear();
            if reader.read_line(&mut line_buffer)? == 0 {
                return Err(PipelineError::MissingHeader(source.to_path_buf()));
            }
            line_number += 1;
            if line_buffer.starts_with("##") {
                continue;
            }
            match line_buffer.strip_prefix('#') {
                Some(header) => {
                    break header
                        .trim_end_matches(['\n', '\r'])
                        .split('\t')
                        .map(str::to_string)
                        .collect::<Vec<String>>();
                }
                None => return Err(PipelineError::MissingHeader(source.to_path_buf())),
            }
        };

        let sample_names: Vec<&str> = match allow_list {
            Some(list) => list.names().iter().map(String::as_str).collect(),
            None => header_names
                .iter()
                .skip(FIRST_SAMPLE_COLUMN)
                .map(String::as_str)
                .collect(),
        };
        let wanted: HashSet<&str> = FIXED_COLUMNS
            .iter()
            .copied()
            .chain(sample_names.iter().copied())
            .collect();

        let indices: Vec<usize> = header_names
            .iter()
            .enumerate()
            .filter(|(_, name)| wanted.contains(name.as_str()))
            .map(|(i, _)| i)
            .collect();
        let columns: Vec<String> = indices.iter().map(|&i| header_names[i].clone()).collect();

        for fixed in FIXED_COLUMNS {
            if !columns.iter().any(|c| c == fixed) {
                return Err(PipelineError::MissingColumn {
                    path: source.to_path_buf(),
                    column: fixed.to_string(),
                });
            }
        }
        if let Some(list) = allow_list {
            let kept = columns.len() - FIXED_COLUMNS.len();
            if kept < list.names().len() {
                warn!(
                    "{} of {} allow-listed samples are absent from {} and were ignored.",
                    list.names().len() - kept,
                    list.names().len(),
                    source.display()
                );
            }
        }
        debug!(
            "Selected {} of {} header columns from {}.",
            columns.len(),
            header_names.len(),
            source.display()
        );

        Ok(Self {
            reader,
            source: source.to_path_buf(),
            columns,
            indices,
            line_number,
            line_buffer,
            finished: false,
        })
    }

    /// Names of the emitted columns, matching the order of every yielded row.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            self.line_buffer.clear();
            if self.reader.read_line(&mut self.line_buffer)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let line = self.line_buffer.trim_end_matches(['\n', '\r']);
            if line == CLOSING_SENTINEL {
                debug!(
                    "Closing sentinel at line {} of {}; stopping.",
                    self.line_number,
                    self.source.display()
                );
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let mut row = Vec::with_capacity(self.indices.len());
            for &index in &self.indices {
                match fields.get(index) {
                    Some(field) => row.push((*field).to_string()),
                    None => {
                        return Err(PipelineError::MalformedRecord {
                            path: self.source.clone(),
                            line: self.line_number,
                            message: format!(
                                "expected at least {} fields, found {}",
                                index + 1,
                                fields.len()
                            ),
                        })
                    }
                }
            }
            return Ok(Some(row));
        }
    }
}

impl<R: BufRead> Iterator for VcfColumnReader<R> {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Parses `vcf_path` and writes the selected columns, header first, to a
/// tab-separated gzip file at `output_path`. Returns the number of data rows.
pub fn extract_columns(
    vcf_path: &Path,
    allow_list: Option<&SampleAllowList>,
    output_path: &Path,
) -> Result<usize> {
    info!(
        "Parsing {} into {}",
        vcf_path.display(),
        output_path.display()
    );
    let reader = VcfColumnReader::open(vcf_path, allow_list)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(create_gzip_text(output_path)?);
    writer.write_record(reader.columns())?;

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {pos} records parsed ({per_sec})")
    {
        spinner.set_style(style);
    }

    let mut rows = 0usize;
    for row in reader {
        writer.write_record(&row?)?;
        rows += 1;
        spinner.inc(1);
    }
    spinner.finish_and_clear();

    let encoder = writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))?;
    encoder.finish()?.flush()?;
    info!("Parsed {} records from {}.", rows, vcf_path.display());
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn write_gzip(path: &Path, contents: &str) {
        let mut encoder = create_gzip_text(path).unwrap();
        encoder.write_all(contents.as_bytes()).unwrap();
        encoder.finish().unwrap().flush().unwrap();
    }

    const SMALL_VCF: &str = "##fileformat=VCFv4.1\n\
##source=test\n\
##INFO=<ID=VT,Number=1,Type=String>\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\n\
1\t100\t.\tA\tG\t50\tPASS\tVT=SNP\tGT\t0|1\t1|1\t0|0\n\
1\t200\t.\tC\tT\t50\tPASS\tVT=SNP;AC=2\tGT\t0|0\t0|1\t1|0\n";

    fn reader_for(text: &str, allow: Option<&SampleAllowList>) -> VcfColumnReader<Cursor<Vec<u8>>> {
        VcfColumnReader::from_reader(
            Cursor::new(text.as_bytes().to_vec()),
            Path::new("memory.vcf"),
            allow,
        )
        .unwrap()
    }

    #[test]
    fn emits_one_row_per_data_line_with_selected_columns() {
        let reader = reader_for(SMALL_VCF, None);
        assert_eq!(
            reader.columns(),
            &["CHROM", "POS", "REF", "ALT", "INFO", "S1", "S2", "S3"]
        );
        let rows: Vec<Vec<String>> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "100", "A", "G", "VT=SNP", "0|1", "1|1", "0|0"]);
        assert_eq!(rows[1][4], "VT=SNP;AC=2");
    }

    #[test]
    fn allow_list_keeps_header_order_and_ignores_unknown_samples() {
        let allow = SampleAllowList::new(vec!["S3".into(), "S1".into(), "NOPE".into()]);
        let reader = reader_for(SMALL_VCF, Some(&allow));
        assert_eq!(reader.columns(), &["CHROM", "POS", "REF", "ALT", "INFO", "S1", "S3"]);
        let rows: Vec<Vec<String>> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(rows[0][5..], ["0|1".to_string(), "0|0".to_string()]);
    }

    #[test]
    fn closing_sentinel_stops_without_error() {
        let text = format!("{}##\n1\t300\t.\tG\tA\t50\tPASS\tVT=SNP\tGT\t0|0\t0|0\t0|0\n", SMALL_VCF);
        let rows: Vec<_> = reader_for(&text, None).collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn short_line_is_reported_with_its_line_number() {
        let text = format!("{}1\t300\t.\tG\n", SMALL_VCF);
        let results: Vec<_> = reader_for(&text, None).collect();
        assert_eq!(results.len(), 3);
        match &results[2] {
            Err(PipelineError::MalformedRecord { line, .. }) => assert_eq!(*line, 7),
            other => panic!("expected MalformedRecord, got {:?}", other),
        }
    }

    #[test]
    fn missing_header_is_an_error() {
        let result = VcfColumnReader::from_reader(
            Cursor::new(b"##only meta\n".to_vec()),
            Path::new("memory.vcf"),
            None,
        );
        assert!(matches!(result, Err(PipelineError::MissingHeader(_))));
    }

    #[test]
    fn extract_columns_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_path = dir.path().join("in.vcf.gz");
        let out_path = dir.path().join("out/output_1.csv.gz");
        let meta: String = (0..50).map(|i| format!("##meta{}\n", i)).collect();
        let body = SMALL_VCF.replacen("##fileformat=VCFv4.1\n", &meta, 1);
        write_gzip(&vcf_path, &body);

        let rows = extract_columns(&vcf_path, None, &out_path).unwrap();
        assert_eq!(rows, 2);

        let mut text = String::new();
        std::io::Read::read_to_string(&mut MultiGzDecoder::new(File::open(&out_path).unwrap()), &mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "CHROM\tPOS\tREF\tALT\tINFO\tS1\tS2\tS3");
        assert_eq!(lines[2], "1\t200\tC\tT\tVT=SNP;AC=2\t0|0\t0|1\t1|0");
    }
}
