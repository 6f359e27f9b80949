// cohort.rs

use crate::error::{PipelineError, Result};
use crate::genotype::{GenotypeEncoder, UnencodedPolicy};
use crate::matrix::{finish_gzip_csv, format_cell, parse_cell};
use crate::vcf::{create_gzip_text, open_gzip_text, FIXED_COLUMNS};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// INFO tokens that mark a control record as a variant worth keeping.
const KEPT_VARIANT_TYPES: [&str; 2] = ["VT=SNP", "VT=INDEL"];

/// Column names of the identity part of a normalized cohort table.
pub const IDENTITY_COLUMNS: [&str; 3] = ["VAR", "REF", "ALT"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CohortKind {
    Cases,
    Controls,
}

impl fmt::Display for CohortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CohortKind::Cases => write!(f, "cases"),
            CohortKind::Controls => write!(f, "controls"),
        }
    }
}

impl FromStr for CohortKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cases" => Ok(CohortKind::Cases),
            "controls" => Ok(CohortKind::Controls),
            other => Err(PipelineError::UnsupportedKeyword {
                what: "cohort ('cases' or 'controls')",
                value: other.to_string(),
            }),
        }
    }
}

/// Join key between cohorts. Equal only when all three strings are equal;
/// allele notation is never normalized.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantIdentity {
    pub position: String,
    pub reference: String,
    pub alternate: String,
}

impl VariantIdentity {
    pub fn new(
        position: impl Into<String>,
        reference: impl Into<String>,
        alternate: impl Into<String>,
    ) -> Self {
        Self {
            position: position.into(),
            reference: reference.into(),
            alternate: alternate.into(),
        }
    }

    /// `chr<CHROM>:<POS>`.
    pub fn locus(chrom: &str, pos: &str) -> String {
        format!("chr{}:{}", chrom, pos)
    }
}

/// One parsed VCF row before normalization, fields by name.
#[derive(Clone, Debug)]
pub struct ParsedRow {
    pub chrom: String,
    pub pos: String,
    pub reference: String,
    pub alternate: String,
    pub info: String,
    pub calls: Vec<String>,
}

/// A normalized row: identity plus the cleaned genotype strings.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedRow {
    pub identity: VariantIdentity,
    pub calls: Vec<String>,
}

impl CohortKind {
    /// Applies the cohort-specific cleanup. Returns `None` when the row is
    /// filtered out. Malformed INFO or genotype text is passed through as is.
    pub fn normalize(&self, row: ParsedRow) -> Option<NormalizedRow> {
        match self {
            CohortKind::Controls => normalize_control(row),
            CohortKind::Cases => Some(normalize_case(row)),
        }
    }
}

fn normalize_control(row: ParsedRow) -> Option<NormalizedRow> {
    let unphase = |field: &str| field.replace('|', "/");
    let info = unphase(&row.info);
    if !info
        .split(';')
        .any(|token| KEPT_VARIANT_TYPES.contains(&token))
    {
        return None;
    }
    Some(NormalizedRow {
        identity: VariantIdentity::new(
            VariantIdentity::locus(&unphase(&row.chrom), &unphase(&row.pos)),
            unphase(&row.reference),
            unphase(&row.alternate),
        ),
        calls: row.calls.iter().map(|call| unphase(call)).collect(),
    })
}

fn normalize_case(row: ParsedRow) -> NormalizedRow {
    let calls = row
        .calls
        .iter()
        .map(|call| {
            let genotype: String = call.chars().take(3).collect();
            if genotype == ".:." {
                ".".to_string()
            } else {
                genotype
            }
        })
        .collect();
    NormalizedRow {
        identity: VariantIdentity::new(
            VariantIdentity::locus(&row.chrom, &row.pos),
            row.reference,
            row.alternate,
        ),
        calls,
    }
}

/// Row counts of one normalization run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub rows_read: usize,
    pub rows_written: usize,
    pub unencoded_cells: usize,
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| PipelineError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

/// Streams a parsed cohort file through normalization and encoding and writes
/// the encoded table (`VAR, REF, ALT, <samples>`) to `output_path`.
pub fn normalize_cohort(
    parsed_path: &Path,
    kind: CohortKind,
    policy: UnencodedPolicy,
    output_path: &Path,
) -> Result<NormalizeSummary> {
    info!("Normalizing {} table {}", kind, parsed_path.display());
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .has_headers(true)
        .from_reader(open_gzip_text(parsed_path)?);
    let headers = reader.headers()?.clone();

    let [chrom_i, pos_i, ref_i, alt_i, info_i] =
        FIXED_COLUMNS.map(|name| column_index(&headers, name, parsed_path));
    let (chrom_i, pos_i, ref_i, alt_i, info_i) = (chrom_i?, pos_i?, ref_i?, alt_i?, info_i?);
    let sample_indices: Vec<usize> = (0..headers.len())
        .filter(|i| !FIXED_COLUMNS.contains(&&headers[*i]))
        .collect();
    let samples: Vec<String> = sample_indices.iter().map(|&i| headers[i].to_string()).collect();

    let mut writer = EncodedTableWriter::create(output_path, &samples)?;
    let mut encoder = GenotypeEncoder::new(policy);
    let mut summary = NormalizeSummary::default();

    for record in reader.records() {
        let record = record?;
        summary.rows_read += 1;
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        let parsed = ParsedRow {
            chrom: field(chrom_i),
            pos: field(pos_i),
            reference: field(ref_i),
            alternate: field(alt_i),
            info: field(info_i),
            calls: sample_indices.iter().map(|&i| field(i)).collect(),
        };
        let Some(normalized) = kind.normalize(parsed) else {
            continue;
        };
        let values = encoder.encode_row(&normalized.identity.position, &samples, &normalized.calls)?;
        writer.write_row(&EncodedRow {
            identity: normalized.identity,
            values,
        })?;
        summary.rows_written += 1;
    }
    writer.finish()?;

    encoder.report(&format!("{} {}", kind, parsed_path.display()));
    summary.unencoded_cells = encoder.unencoded_cells();
    info!(
        "Normalized {} table: {} of {} rows kept.",
        kind, summary.rows_written, summary.rows_read
    );
    Ok(summary)
}

/// An encoded variant row: identity plus one value per sample (NaN = missing).
#[derive(Clone, Debug)]
pub struct EncodedRow {
    pub identity: VariantIdentity,
    pub values: Vec<f64>,
}

/// A whole encoded cohort table for one chromosome, variant-major.
#[derive(Clone, Debug, Default)]
pub struct EncodedCohortTable {
    pub samples: Vec<String>,
    pub rows: Vec<EncodedRow>,
}

impl EncodedCohortTable {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = EncodedTableReader::open(path)?;
        let samples = reader.samples().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = reader.next_row()? {
            rows.push(row);
        }
        debug!("Loaded {} encoded rows from {}.", rows.len(), path.display());
        Ok(Self { samples, rows })
    }
}

/// Incremental writer for encoded cohort tables.
pub struct EncodedTableWriter {
    writer: csv::Writer<flate2::write::GzEncoder<std::io::BufWriter<File>>>,
}

impl EncodedTableWriter {
    pub fn create(path: &Path, samples: &[String]) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(create_gzip_text(path)?);
        writer.write_record(
            IDENTITY_COLUMNS
                .iter()
                .copied()
                .chain(samples.iter().map(String::as_str)),
        )?;
        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &EncodedRow) -> Result<()> {
        let identity = [
            row.identity.position.clone(),
            row.identity.reference.clone(),
            row.identity.alternate.clone(),
        ];
        self.writer.write_record(
            identity
                .into_iter()
                .chain(row.values.iter().map(|v| format_cell(*v))),
        )?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        finish_gzip_csv(self.writer)
    }
}

/// Streaming reader for encoded cohort tables, supporting chunked reads.
pub struct EncodedTableReader {
    path: PathBuf,
    samples: Vec<String>,
    records: csv::StringRecordsIntoIter<BufReader<MultiGzDecoder<File>>>,
    line: usize,
}

impl EncodedTableReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .has_headers(true)
            .from_reader(open_gzip_text(path)?);
        let headers = reader.headers()?.clone();
        for (i, expected) in IDENTITY_COLUMNS.iter().enumerate() {
            if headers.get(i) != Some(*expected) {
                return Err(PipelineError::MissingColumn {
                    path: path.to_path_buf(),
                    column: expected.to_string(),
                });
            }
        }
        let samples = headers
            .iter()
            .skip(IDENTITY_COLUMNS.len())
            .map(str::to_string)
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            samples,
            records: reader.into_records(),
            line: 1,
        })
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn next_row(&mut self) -> Result<Option<EncodedRow>> {
        let record = match self.records.next() {
            Some(record) => record?,
            None => return Ok(None),
        };
        self.line += 1;
        let expected = IDENTITY_COLUMNS.len() + self.samples.len();
        if record.len() != expected {
            return Err(PipelineError::MalformedRecord {
                path: self.path.clone(),
                line: self.line,
                message: format!("expected {} fields, found {}", expected, record.len()),
            });
        }
        let values = record
            .iter()
            .skip(IDENTITY_COLUMNS.len())
            .map(|cell| {
                parse_cell(cell).ok_or_else(|| PipelineError::MalformedRecord {
                    path: self.path.clone(),
                    line: self.line,
                    message: format!("non-numeric cell '{}'", cell),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(Some(EncodedRow {
            identity: VariantIdentity::new(&record[0], &record[1], &record[2]),
            values,
        }))
    }

    /// Reads up to `size` rows; an empty result means the table is exhausted.
    pub fn next_chunk(&mut self, size: usize) -> Result<Vec<EncodedRow>> {
        let mut chunk = Vec::with_capacity(size.min(4096));
        while chunk.len() < size {
            match self.next_row()? {
                Some(row) => chunk.push(row),
                None => break,
            }
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcf::tests::write_gzip;

    fn parsed(info: &str, calls: &[&str]) -> ParsedRow {
        ParsedRow {
            chrom: "1".into(),
            pos: "100".into(),
            reference: "A".into(),
            alternate: "G".into(),
            info: info.into(),
            calls: calls.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn controls_keep_only_snp_and_indel_rows() {
        let kind = CohortKind::Controls;
        assert!(kind.normalize(parsed("AC=1;VT=SNP", &["0|1"])).is_some());
        assert!(kind.normalize(parsed("VT=INDEL", &["0|1"])).is_some());
        assert!(kind.normalize(parsed("VT=SV;AC=1", &["0|1"])).is_none());
        assert!(kind.normalize(parsed("VT=SNPX", &["0|1"])).is_none());
        assert!(kind.normalize(parsed("", &["0|1"])).is_none());
    }

    #[test]
    fn controls_unphase_calls_and_build_identity() {
        let row = CohortKind::Controls
            .normalize(parsed("VT=SNP", &["0|1", "1|1", "./."]))
            .unwrap();
        assert_eq!(row.identity, VariantIdentity::new("chr1:100", "A", "G"));
        assert_eq!(row.calls, vec!["0/1", "1/1", "./."]);
    }

    #[test]
    fn cases_truncate_calls_and_collapse_missing_marker() {
        let row = CohortKind::Cases
            .normalize(parsed("garbage", &["0/1:35:99", ".:.:0", "./.", "1/1"]))
            .unwrap();
        assert_eq!(row.identity.position, "chr1:100");
        assert_eq!(row.calls, vec!["0/1", ".", "./.", "1/1"]);
    }

    #[test]
    fn normalize_cohort_writes_encoded_table() {
        let dir = tempfile::tempdir().unwrap();
        let parsed_path = dir.path().join("output_1.csv.gz");
        let out = dir.path().join("normalized_1.csv.gz");
        write_gzip(
            &parsed_path,
            "CHROM\tPOS\tREF\tALT\tINFO\tC1\tC2\n\
             1\t100\tA\tG\tVT=SNP\t0|1\t1|1\n\
             1\t150\tA\tAT\tVT=SV\t0|1\t1|1\n\
             1\t200\tC\tT\tVT=INDEL\t./.\t1|0\n",
        );

        let summary =
            normalize_cohort(&parsed_path, CohortKind::Controls, UnencodedPolicy::Fail, &out).unwrap();
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.rows_written, 2);

        let table = EncodedCohortTable::read(&out).unwrap();
        assert_eq!(table.samples, vec!["C1", "C2"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].identity, VariantIdentity::new("chr1:100", "A", "G"));
        assert_eq!(table.rows[0].values, vec![1.0, 2.0]);
        assert!(table.rows[1].values[0].is_nan());
        assert_eq!(table.rows[1].values[1], 1.0);
    }

    #[test]
    fn phased_case_calls_surface_as_unencoded() {
        let dir = tempfile::tempdir().unwrap();
        let parsed_path = dir.path().join("output_2.csv.gz");
        write_gzip(
            &parsed_path,
            "CHROM\tPOS\tREF\tALT\tINFO\tEx1\n2\t10\tA\tG\t.\t0|1:20\n",
        );
        let out = dir.path().join("normalized_2.csv.gz");
        let err = normalize_cohort(&parsed_path, CohortKind::Cases, UnencodedPolicy::Fail, &out)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnencodedGenotype { .. }));

        let summary =
            normalize_cohort(&parsed_path, CohortKind::Cases, UnencodedPolicy::Missing, &out).unwrap();
        assert_eq!(summary.unencoded_cells, 1);
    }

    #[test]
    fn chunked_reads_cover_the_whole_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv.gz");
        let samples = vec!["S".to_string()];
        let mut writer = EncodedTableWriter::create(&path, &samples).unwrap();
        for i in 0..5 {
            writer
                .write_row(&EncodedRow {
                    identity: VariantIdentity::new(format!("chr1:{}", i), "A", "C"),
                    values: vec![i as f64],
                })
                .unwrap();
        }
        writer.finish().unwrap();

        let mut reader = EncodedTableReader::open(&path).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            let chunk = reader.next_chunk(2).unwrap();
            (!chunk.is_empty()).then_some(chunk.len())
        })
        .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
