// assemble.rs

use crate::error::Result;
use crate::matrix::{DatasetTag, FeatureMatrix, SampleMatrix, Stage};
use log::{debug, info};
use ndarray::{s, Array2};
use std::collections::HashMap;

/// Sample identifiers starting with this prefix are cases.
pub const DEFAULT_CASE_PREFIX: &str = "Ex";

/// 1 for a case sample, 0 for a control.
pub fn label_for(sample: &str, case_prefix: &str) -> u8 {
    u8::from(sample.starts_with(case_prefix))
}

/// Concatenates per-chromosome matrices column-wise over the outer union of
/// their sample indices (first-appearance order). Cells of a sample absent from
/// a chromosome are NaN. Labels are derived from the sample names.
pub fn assemble(parts: &[SampleMatrix], case_prefix: &str) -> Result<FeatureMatrix> {
    let mut samples: Vec<String> = Vec::new();
    let mut rows: HashMap<&str, usize> = HashMap::new();
    for part in parts {
        for sample in &part.samples {
            if !rows.contains_key(sample.as_str()) {
                rows.insert(sample.as_str(), samples.len());
                samples.push(sample.clone());
            }
        }
    }

    let total_columns: usize = parts.iter().map(|p| p.columns.len()).sum();
    let mut values = Array2::<f64>::from_elem((samples.len(), total_columns), f64::NAN);
    let mut columns = Vec::with_capacity(total_columns);
    let mut offset = 0usize;
    for part in parts {
        let width = part.columns.len();
        if width == 0 {
            debug!("Skipping a chromosome matrix with no variant columns.");
            continue;
        }
        for (i, sample) in part.samples.iter().enumerate() {
            let row = rows[sample.as_str()];
            values
                .slice_mut(s![row, offset..offset + width])
                .assign(&part.values.row(i));
        }
        columns.extend(part.columns.iter().cloned());
        offset += width;
    }

    let labels: Vec<u8> = samples.iter().map(|s| label_for(s, case_prefix)).collect();
    let cases = labels.iter().filter(|&&l| l == 1).count();
    info!(
        "Assembled matrix: {} samples ({} cases, {} controls) x {} variants.",
        samples.len(),
        cases,
        samples.len() - cases,
        total_columns
    );
    FeatureMatrix::new(samples, columns, values, labels, DatasetTag::new(Stage::Merged))
}
