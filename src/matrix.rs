// matrix.rs

use crate::error::{PipelineError, Result};
use crate::reduce::SelectionMode;
use crate::vcf::{create_gzip_text, open_gzip_text};
use log::debug;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Header of the sample index column in persisted chromosome matrices.
pub const SAMPLE_INDEX_COLUMN: &str = "Samples";

/// Name of the case/control label column.
pub const LABEL_COLUMN: &str = "labels";

/// Written in the gene row for columns without a gene.
pub const NO_GENE: &str = "None";

/// Formats a matrix cell: shortest round-trip decimal, NaN as an empty field.
pub fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

/// Parses a matrix cell written by `format_cell` (also accepts `nan`/`NA`).
pub fn parse_cell(text: &str) -> Option<f64> {
    match text.trim() {
        "" | "nan" | "NaN" | "NA" => Some(f64::NAN),
        other => other.parse::<f64>().ok(),
    }
}

/// Gene label as read from disk; the no-gene spellings map to `None`.
pub fn parse_gene_label(text: &str) -> Option<String> {
    match text.trim() {
        "" | "None" | "NONE" => None,
        gene => Some(gene.to_string()),
    }
}

fn is_gene_row_label(cell: &str, last_record: bool) -> bool {
    matches!(cell, "None" | "NONE") || (last_record && cell.is_empty())
}

/// Which stage produced a matrix. Carried alongside the data instead of being
/// recovered from file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Chromosome,
    Merged,
    Cleaned,
    Imputed,
    Annotated,
    Reduced,
    External,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetTag {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chromosome: Option<String>,
}

impl DatasetTag {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            selection: None,
            chromosome: None,
        }
    }

    pub fn with_selection(mut self, selection: SelectionMode) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_chromosome(mut self, chromosome: impl Into<String>) -> Self {
        self.chromosome = Some(chromosome.into());
        self
    }

    /// Short name for output files and log lines, e.g. `reduced_pval`.
    pub fn name(&self) -> String {
        let stage = serde_json::to_value(self.stage)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match (&self.selection, &self.chromosome) {
            (Some(selection), _) => format!("{}_{}", stage, selection),
            (None, Some(chromosome)) => format!("{}_chr{}", stage, chromosome),
            (None, None) => stage,
        }
    }
}

/// Samples × columns numeric table with a sample index. Used for
/// per-chromosome matrices.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleMatrix {
    pub samples: Vec<String>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl SampleMatrix {
    pub fn empty(samples: Vec<String>) -> Self {
        let rows = samples.len();
        Self {
            samples,
            columns: Vec::new(),
            values: Array2::zeros((rows, 0)),
        }
    }

    /// Writes `Samples,<columns...>` then one row per sample, gzip-compressed.
    pub fn write_csv_gz(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(create_gzip_text(path)?);
        writer.write_record(
            std::iter::once(SAMPLE_INDEX_COLUMN).chain(self.columns.iter().map(String::as_str)),
        )?;
        for (sample, row) in self.samples.iter().zip(self.values.axis_iter(Axis(0))) {
            writer.write_record(
                std::iter::once(sample.clone()).chain(row.iter().map(|v| format_cell(*v))),
            )?;
        }
        finish_gzip_csv(writer)
    }

    pub fn read_csv_gz(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(open_gzip_text(path)?);
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some(SAMPLE_INDEX_COLUMN) {
            return Err(PipelineError::MissingColumn {
                path: path.to_path_buf(),
                column: SAMPLE_INDEX_COLUMN.to_string(),
            });
        }
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        let mut samples = Vec::new();
        let mut flat = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record?;
            let line = i + 2;
            if record.len() != columns.len() + 1 {
                return Err(PipelineError::MalformedRecord {
                    path: path.to_path_buf(),
                    line,
                    message: format!("expected {} fields, found {}", columns.len() + 1, record.len()),
                });
            }
            samples.push(record[0].to_string());
            for cell in record.iter().skip(1) {
                flat.push(parse_numeric(cell, path, line)?);
            }
        }
        let values = Array2::from_shape_vec((samples.len(), columns.len()), flat)
            .map_err(|e| PipelineError::Shape(e.to_string()))?;
        debug!(
            "Read {}x{} matrix from {}.",
            values.nrows(),
            values.ncols(),
            path.display()
        );
        Ok(Self {
            samples,
            columns,
            values,
        })
    }
}

fn parse_numeric(cell: &str, path: &Path, line: usize) -> Result<f64> {
    parse_cell(cell).ok_or_else(|| PipelineError::MalformedRecord {
        path: path.to_path_buf(),
        line,
        message: format!("non-numeric cell '{}'", cell),
    })
}

pub(crate) fn finish_gzip_csv(
    writer: csv::Writer<flate2::write::GzEncoder<std::io::BufWriter<std::fs::File>>>,
) -> Result<()> {
    let encoder = writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Sample × feature matrix with its case/control labels, and optionally a gene
/// label per column. The label column never takes part in column operations.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMatrix {
    pub samples: Vec<String>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
    pub labels: Vec<u8>,
    pub genes: Option<Vec<Option<String>>>,
    pub tag: DatasetTag,
}

impl FeatureMatrix {
    pub fn new(
        samples: Vec<String>,
        columns: Vec<String>,
        values: Array2<f64>,
        labels: Vec<u8>,
        tag: DatasetTag,
    ) -> Result<Self> {
        if values.nrows() != samples.len() || labels.len() != samples.len() {
            return Err(PipelineError::Shape(format!(
                "{} samples, {} labels, {} matrix rows",
                samples.len(),
                labels.len(),
                values.nrows()
            )));
        }
        if values.ncols() != columns.len() {
            return Err(PipelineError::Shape(format!(
                "{} column names for {} matrix columns",
                columns.len(),
                values.ncols()
            )));
        }
        Ok(Self {
            samples,
            columns,
            values,
            labels,
            genes: None,
            tag,
        })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Keeps the listed columns, in the given order, with their gene labels.
    pub fn select_columns(&self, keep: &[usize]) -> Self {
        Self {
            samples: self.samples.clone(),
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            values: self.values.select(Axis(1), keep),
            labels: self.labels.clone(),
            genes: self
                .genes
                .as_ref()
                .map(|genes| keep.iter().map(|&i| genes[i].clone()).collect()),
            tag: self.tag.clone(),
        }
    }

    pub fn with_tag(mut self, tag: DatasetTag) -> Self {
        self.tag = tag;
        self
    }

    /// Writes `<columns...>,labels` rows (no sample column), and a trailing
    /// gene-label row when genes are attached.
    pub fn write_csv_gz(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(create_gzip_text(path)?);
        writer.write_record(
            self.columns
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(LABEL_COLUMN)),
        )?;
        for (row, label) in self.values.axis_iter(Axis(0)).zip(&self.labels) {
            writer.write_record(
                row.iter()
                    .map(|v| format_cell(*v))
                    .chain(std::iter::once(label.to_string())),
            )?;
        }
        if let Some(genes) = &self.genes {
            writer.write_record(
                genes
                    .iter()
                    .map(|g| g.as_deref().unwrap_or(NO_GENE))
                    .chain(std::iter::once(NO_GENE)),
            )?;
        }
        finish_gzip_csv(writer)?;
        debug!(
            "Wrote {}x{} matrix to {}.",
            self.nrows(),
            self.ncols(),
            path.display()
        );
        Ok(())
    }

    /// Reads a matrix written by `write_csv_gz`. The last column must be
    /// `labels`. The gene row is the one whose label cell holds the `None`
    /// sentinel, or an empty label cell on the final record.
    /// A leading `Samples` column, if present, becomes the sample index;
    /// otherwise samples are numbered from 0.
    pub fn read_csv_gz(path: &Path, tag: DatasetTag) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(open_gzip_text(path)?);
        let headers = reader.headers()?.clone();
        if headers.iter().last() != Some(LABEL_COLUMN) {
            return Err(PipelineError::MissingColumn {
                path: path.to_path_buf(),
                column: LABEL_COLUMN.to_string(),
            });
        }
        let has_index = headers.get(0) == Some(SAMPLE_INDEX_COLUMN);
        let first = usize::from(has_index);
        let last = headers.len() - 1;
        let columns: Vec<String> = (first..last).map(|i| headers[i].to_string()).collect();

        let mut samples = Vec::new();
        let mut labels = Vec::new();
        let mut flat = Vec::new();
        let mut genes = None;
        let mut records = reader.records().enumerate().peekable();
        while let Some((i, record)) = records.next() {
            let record = record?;
            let line = i + 2;
            if genes.is_some() {
                return Err(PipelineError::MalformedRecord {
                    path: path.to_path_buf(),
                    line,
                    message: "data row after the gene-label row".to_string(),
                });
            }
            if record.len() != headers.len() {
                return Err(PipelineError::MalformedRecord {
                    path: path.to_path_buf(),
                    line,
                    message: format!("expected {} fields, found {}", headers.len(), record.len()),
                });
            }
            let label_cell = record[last].trim();
            if is_gene_row_label(label_cell, records.peek().is_none()) {
                genes = Some((first..last).map(|c| parse_gene_label(&record[c])).collect());
                continue;
            }
            let label = match parse_cell(label_cell) {
                Some(v) if v == 0.0 || v == 1.0 => v as u8,
                _ => {
                    return Err(PipelineError::MalformedRecord {
                        path: path.to_path_buf(),
                        line,
                        message: format!("label '{}' is neither 0 nor 1", label_cell),
                    })
                }
            };
            samples.push(if has_index {
                record[0].to_string()
            } else {
                samples.len().to_string()
            });
            labels.push(label);
            for c in first..last {
                flat.push(parse_numeric(&record[c], path, line)?);
            }
        }
        let values = Array2::from_shape_vec((samples.len(), columns.len()), flat)
            .map_err(|e| PipelineError::Shape(e.to_string()))?;
        let mut matrix = Self::new(samples, columns, values, labels, tag)?;
        matrix.genes = genes;
        debug!(
            "Read {}x{} matrix from {} (gene row: {}).",
            matrix.nrows(),
            matrix.ncols(),
            path.display(),
            matrix.genes.is_some()
        );
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cells_round_trip_nan_as_empty() {
        assert_eq!(format_cell(f64::NAN), "");
        assert_eq!(format_cell(2.0), "2");
        assert_eq!(format_cell(0.25), "0.25");
        assert!(parse_cell("").unwrap().is_nan());
        assert_eq!(parse_cell("3"), Some(3.0));
        assert_eq!(parse_cell("x"), None);
    }

    #[test]
    fn sample_matrix_keeps_index_and_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chr1.csv.gz");
        let matrix = SampleMatrix {
            samples: vec!["Ex1".into(), "Ct1".into()],
            columns: vec!["chr1:5".into(), "chr1:9".into()],
            values: array![[0.0, f64::NAN], [2.0, 27.0]],
        };
        matrix.write_csv_gz(&path).unwrap();
        let back = SampleMatrix::read_csv_gz(&path).unwrap();
        assert_eq!(back.samples, matrix.samples);
        assert_eq!(back.columns, matrix.columns);
        assert!(back.values[[0, 1]].is_nan());
        assert_eq!(back.values[[1, 1]], 27.0);
    }

    #[test]
    fn feature_matrix_reads_gene_row_as_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.csv.gz");
        let mut matrix = FeatureMatrix::new(
            vec!["0".into(), "1".into()],
            vec!["chr1:5".into(), "chr1:9".into()],
            array![[0.0, 1.0], [2.0, 1.0]],
            vec![1, 0],
            DatasetTag::new(Stage::Annotated),
        )
        .unwrap();
        matrix.genes = Some(vec![Some("BRCA2".into()), None]);
        matrix.write_csv_gz(&path).unwrap();

        let back = FeatureMatrix::read_csv_gz(&path, DatasetTag::new(Stage::Annotated)).unwrap();
        assert_eq!(back.nrows(), 2);
        assert_eq!(back.labels, vec![1, 0]);
        assert_eq!(back.genes, Some(vec![Some("BRCA2".to_string()), None]));
        assert_eq!(back, matrix);
    }

    #[test]
    fn missing_label_on_a_data_row_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank_label.csv.gz");
        let mut writer = create_gzip_text(&path).unwrap();
        writer
            .write_all(b"chr1:5,labels\n1,\n2,0\nBRCA2,None\n")
            .unwrap();
        writer.finish().unwrap().flush().unwrap();

        let err = FeatureMatrix::read_csv_gz(&path, DatasetTag::new(Stage::External)).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { line: 2, .. }));
    }

    #[test]
    fn trailing_row_with_empty_label_is_the_gene_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pandas_genes.csv.gz");
        let mut writer = create_gzip_text(&path).unwrap();
        writer.write_all(b"chr1:5,chr1:9,labels\n0,1,1\nSHANK3,,\n").unwrap();
        writer.finish().unwrap().flush().unwrap();

        let back = FeatureMatrix::read_csv_gz(&path, DatasetTag::new(Stage::External)).unwrap();
        assert_eq!(back.labels, vec![1]);
        assert_eq!(back.genes, Some(vec![Some("SHANK3".to_string()), None]));
    }

    #[test]
    fn select_columns_carries_genes() {
        let mut matrix = FeatureMatrix::new(
            vec!["a".into()],
            vec!["x".into(), "y".into(), "z".into()],
            array![[1.0, 2.0, 3.0]],
            vec![0],
            DatasetTag::new(Stage::Merged),
        )
        .unwrap();
        matrix.genes = Some(vec![None, Some("G".into()), None]);
        let selected = matrix.select_columns(&[2, 1]);
        assert_eq!(selected.columns, vec!["z", "y"]);
        assert_eq!(selected.values, array![[3.0, 2.0]]);
        assert_eq!(selected.genes, Some(vec![None, Some("G".to_string())]));
    }

    #[test]
    fn tag_names_are_structured() {
        assert_eq!(DatasetTag::new(Stage::Merged).name(), "merged");
        assert_eq!(
            DatasetTag::new(Stage::Reduced).with_selection(SelectionMode::Pval).name(),
            "reduced_pval"
        );
        assert_eq!(
            DatasetTag::new(Stage::Chromosome).with_chromosome("X").name(),
            "chromosome_chrX"
        );
    }
}
