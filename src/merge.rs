// merge.rs

use crate::cohort::{EncodedCohortTable, EncodedTableReader, VariantIdentity, IDENTITY_COLUMNS};
use crate::error::Result;
use crate::layout::ensure_parent;
use crate::matrix::SampleMatrix;
use log::{debug, info};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Rows read per chunk from the (potentially huge) control table.
pub const CONTROL_CHUNK_ROWS: usize = 250_000;

/// Output of merging one chromosome: the sample-major numeric body and the
/// identity of every body column.
#[derive(Clone, Debug)]
pub struct ChromosomeMatrix {
    pub matrix: SampleMatrix,
    pub info: Vec<VariantIdentity>,
}

impl ChromosomeMatrix {
    pub fn variant_count(&self) -> usize {
        self.info.len()
    }

    /// Writes the body as gzip CSV and the identities as a plain CSV side table.
    pub fn persist(&self, matrix_path: &Path, info_path: &Path) -> Result<()> {
        self.matrix.write_csv_gz(matrix_path)?;
        ensure_parent(info_path)?;
        let mut writer = csv::Writer::from_path(info_path)?;
        writer.write_record(IDENTITY_COLUMNS)?;
        for identity in &self.info {
            writer.write_record([&identity.position, &identity.reference, &identity.alternate])?;
        }
        writer.flush()?;
        info!(
            "Saved {} variants x {} samples to {} (info: {}).",
            self.variant_count(),
            self.matrix.samples.len(),
            matrix_path.display(),
            info_path.display()
        );
        Ok(())
    }
}

/// Reads the encoded control table chunk by chunk, keeping only rows whose
/// position occurs in `case_positions`. Peak memory is bounded by the rows
/// kept, not by the size of the control table.
pub fn filter_controls(
    path: &Path,
    case_positions: &HashSet<String>,
    chunk_rows: usize,
) -> Result<EncodedCohortTable> {
    let mut reader = EncodedTableReader::open(path)?;
    let samples = reader.samples().to_vec();
    let mut rows = Vec::new();
    let mut scanned = 0usize;
    loop {
        let chunk = reader.next_chunk(chunk_rows.max(1))?;
        if chunk.is_empty() {
            break;
        }
        scanned += chunk.len();
        rows.extend(
            chunk
                .into_iter()
                .filter(|row| case_positions.contains(&row.identity.position)),
        );
        debug!("Scanned {} control rows, kept {}.", scanned, rows.len());
    }
    info!(
        "Control table {}: kept {} of {} rows present in the case table.",
        path.display(),
        rows.len(),
        scanned
    );
    Ok(EncodedCohortTable { samples, rows })
}

/// Bit pattern used to compare rows for duplicate removal; all NaNs are equal.
fn cell_key(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Inner-joins cases and controls on the full variant identity, collapses
/// fully identical joined rows, and transposes to samples × variants.
///
/// Samples named in both cohorts share one row; its cell takes the case value
/// unless that is missing. Row order is case samples, then control-only
/// samples. Column order follows the case table, then control order within a
/// case row. An empty join yields a matrix with zero columns.
pub fn merge_cohorts(cases: &EncodedCohortTable, controls: &EncodedCohortTable) -> ChromosomeMatrix {
    let mut control_rows: HashMap<&VariantIdentity, Vec<usize>> = HashMap::new();
    for (i, row) in controls.rows.iter().enumerate() {
        control_rows.entry(&row.identity).or_default().push(i);
    }

    let mut seen: HashSet<(VariantIdentity, Vec<u64>)> = HashSet::new();
    let mut joined: Vec<(VariantIdentity, Vec<f64>, Vec<f64>)> = Vec::new();
    for case_row in &cases.rows {
        let Some(matches) = control_rows.get(&case_row.identity) else {
            continue;
        };
        for &c in matches {
            let control_row = &controls.rows[c];
            let key: Vec<u64> = case_row
                .values
                .iter()
                .chain(&control_row.values)
                .map(|v| cell_key(*v))
                .collect();
            if seen.insert((case_row.identity.clone(), key)) {
                joined.push((
                    case_row.identity.clone(),
                    case_row.values.clone(),
                    control_row.values.clone(),
                ));
            }
        }
    }

    let mut samples: Vec<String> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let case_slots: Vec<usize> = cases
        .samples
        .iter()
        .map(|s| sample_slot(s, &mut samples, &mut slots))
        .collect();
    let control_slots: Vec<usize> = controls
        .samples
        .iter()
        .map(|s| sample_slot(s, &mut samples, &mut slots))
        .collect();

    let mut values = Array2::<f64>::from_elem((samples.len(), joined.len()), f64::NAN);
    for (column, (_, case_values, control_values)) in joined.iter().enumerate() {
        for (&slot, &value) in control_slots.iter().zip(control_values) {
            values[[slot, column]] = value;
        }
        for (&slot, &value) in case_slots.iter().zip(case_values) {
            if !value.is_nan() {
                values[[slot, column]] = value;
            }
        }
    }

    let info: Vec<VariantIdentity> = joined.into_iter().map(|(identity, _, _)| identity).collect();
    let columns = info.iter().map(|identity| identity.position.clone()).collect();
    info!(
        "Merged cohorts: {} shared variants across {} samples.",
        info.len(),
        samples.len()
    );
    ChromosomeMatrix {
        matrix: SampleMatrix {
            samples,
            columns,
            values,
        },
        info,
    }
}

/// Row of `name` in the merged sample index, appending it on first sight.
fn sample_slot(name: &str, samples: &mut Vec<String>, slots: &mut HashMap<String, usize>) -> usize {
    if let Some(&slot) = slots.get(name) {
        return slot;
    }
    samples.push(name.to_string());
    slots.insert(name.to_string(), samples.len() - 1);
    samples.len() - 1
}

/// Loads the case table whole, streams the control table against it, merges.
pub fn merge_chromosome(case_path: &Path, control_path: &Path) -> Result<ChromosomeMatrix> {
    info!("Loading case table {}", case_path.display());
    let cases = EncodedCohortTable::read(case_path)?;
    let case_positions: HashSet<String> = cases
        .rows
        .iter()
        .map(|row| row.identity.position.clone())
        .collect();
    let controls = filter_controls(control_path, &case_positions, CONTROL_CHUNK_ROWS)?;
    Ok(merge_cohorts(&cases, &controls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::EncodedRow;

    fn row(position: &str, reference: &str, alternate: &str, values: &[f64]) -> EncodedRow {
        EncodedRow {
            identity: VariantIdentity::new(position, reference, alternate),
            values: values.to_vec(),
        }
    }

    fn table(samples: &[&str], rows: Vec<EncodedRow>) -> EncodedCohortTable {
        EncodedCohortTable {
            samples: samples.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn join_requires_identical_alleles() {
        let cases = table(
            &["Ex1"],
            vec![row("chr1:10", "A", "G", &[1.0]), row("chr1:20", "C", "T", &[2.0])],
        );
        let controls = table(
            &["Ct1"],
            vec![row("chr1:10", "A", "G", &[0.0]), row("chr1:20", "C", "G", &[0.0])],
        );
        let merged = merge_cohorts(&cases, &controls);
        assert_eq!(merged.info, vec![VariantIdentity::new("chr1:10", "A", "G")]);
        assert_eq!(merged.matrix.columns, vec!["chr1:10"]);
        assert_eq!(merged.matrix.samples, vec!["Ex1", "Ct1"]);
        assert_eq!(merged.matrix.values[[0, 0]], 1.0);
        assert_eq!(merged.matrix.values[[1, 0]], 0.0);
    }

    #[test]
    fn swapping_inputs_keeps_the_variant_set() {
        let a = table(
            &["Ex1", "Ex2"],
            vec![
                row("chr2:1", "A", "G", &[1.0, 0.0]),
                row("chr2:2", "A", "T", &[2.0, 1.0]),
                row("chr2:3", "G", "C", &[0.0, 0.0]),
            ],
        );
        let b = table(
            &["Ct1"],
            vec![
                row("chr2:3", "G", "C", &[1.0]),
                row("chr2:1", "A", "G", &[0.0]),
                row("chr2:2", "A", "C", &[0.0]),
            ],
        );
        let forward: HashSet<VariantIdentity> = merge_cohorts(&a, &b).info.into_iter().collect();
        let backward: HashSet<VariantIdentity> = merge_cohorts(&b, &a).info.into_iter().collect();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn identical_joined_rows_collapse() {
        let cases = table(
            &["Ex1"],
            vec![row("chr3:5", "A", "G", &[1.0]), row("chr3:5", "A", "G", &[1.0])],
        );
        let controls = table(&["Ct1"], vec![row("chr3:5", "A", "G", &[f64::NAN])]);
        let merged = merge_cohorts(&cases, &controls);
        assert_eq!(merged.variant_count(), 1);
        assert!(merged.matrix.values[[1, 0]].is_nan());
    }

    #[test]
    fn empty_join_gives_zero_columns() {
        let cases = table(&["Ex1"], vec![row("chr4:1", "A", "G", &[1.0])]);
        let controls = table(&["Ct1"], vec![row("chr4:2", "A", "G", &[1.0])]);
        let merged = merge_cohorts(&cases, &controls);
        assert_eq!(merged.variant_count(), 0);
        assert_eq!(merged.matrix.values.dim(), (2, 0));
    }

    #[test]
    fn shared_samples_fill_from_the_other_cohort() {
        let cases = table(
            &["Ex1", "Ex2", "Ct1"],
            vec![
                row("chr5:1", "A", "G", &[1.0, 2.0, f64::NAN]),
                row("chr5:2", "C", "T", &[0.0, 0.0, 0.0]),
            ],
        );
        let controls = table(
            &["Ct1", "Ex1", "Ex2"],
            vec![
                row("chr5:1", "A", "G", &[0.0, 1.0, f64::NAN]),
                row("chr5:2", "C", "A", &[0.0, 0.0, 0.0]),
            ],
        );
        let merged = merge_cohorts(&cases, &controls);
        assert_eq!(merged.matrix.values.dim(), (3, 1));
        assert_eq!(merged.matrix.samples, vec!["Ex1", "Ex2", "Ct1"]);
        assert_eq!(merged.matrix.values[[0, 0]], 1.0);
        assert_eq!(merged.matrix.values[[1, 0]], 2.0);
        assert_eq!(merged.matrix.values[[2, 0]], 0.0);
    }
}
