// stats.rs

use crate::error::{PipelineError, Result};
use crate::layout::ensure_parent;
use crate::matrix::FeatureMatrix;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::HashMap;
use std::path::Path;

/// Significance level shared by both tests.
pub const ALPHA: f64 = 0.05;

/// Written in place of a p-value that underflowed to zero.
pub const P_FLOOR: f64 = 1e-40;

/// Fewest observations the skewness test accepts.
pub const MIN_NORMALITY_OBSERVATIONS: usize = 8;

/// Bar for per-column or per-gene work.
pub(crate) fn progress_bar(len: usize, unit: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
            unit
        ))
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// One row of `sigVars.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignificanceRecord {
    pub pval: f64,
    #[serde(rename = "Variants")]
    pub variant: String,
}

/// One row of `notnormal.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalityRecord {
    #[serde(rename = "Variant")]
    pub variant: String,
    pub pval: f64,
}

fn chi_squared_sf(statistic: f64, dof: usize, variant: &str) -> Result<f64> {
    let distribution = ChiSquared::new(dof as f64).map_err(|e| PipelineError::Statistics {
        variant: variant.to_string(),
        message: e.to_string(),
    })?;
    Ok(distribution.sf(statistic))
}

/// Pearson χ² for the contingency table of observed values against labels,
/// without continuity correction. Missing cells are left out of the table.
pub fn contingency_p_value(column: ArrayView1<f64>, labels: &[u8], variant: &str) -> Result<f64> {
    let mut values: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup();
    let mut classes: Vec<u8> = labels
        .iter()
        .zip(column.iter())
        .filter(|(_, v)| !v.is_nan())
        .map(|(&l, _)| l)
        .collect();
    classes.sort_unstable();
    classes.dedup();

    let dof = values.len().saturating_sub(1) * classes.len().saturating_sub(1);
    if dof == 0 {
        return Ok(1.0);
    }

    let mut observed = vec![vec![0.0f64; classes.len()]; values.len()];
    for (&value, &label) in column.iter().zip(labels) {
        if value.is_nan() {
            continue;
        }
        if let (Ok(r), Ok(c)) = (
            values.binary_search_by(|v| v.total_cmp(&value)),
            classes.binary_search(&label),
        ) {
            observed[r][c] += 1.0;
        }
    }
    let row_totals: Vec<f64> = observed.iter().map(|row| row.iter().sum()).collect();
    let col_totals: Vec<f64> = (0..classes.len())
        .map(|c| observed.iter().map(|row| row[c]).sum())
        .collect();
    let total: f64 = row_totals.iter().sum();

    let mut statistic = 0.0;
    for (r, row) in observed.iter().enumerate() {
        for (c, &o) in row.iter().enumerate() {
            let expected = row_totals[r] * col_totals[c] / total;
            statistic += (o - expected) * (o - expected) / expected;
        }
    }
    chi_squared_sf(statistic, dof, variant)
}

/// Association test of every column against the labels, in column order.
pub fn chi_squared_test(data: &FeatureMatrix) -> Result<Vec<SignificanceRecord>> {
    info!("Testing significance of {} variants...", data.ncols());
    let bar = progress_bar(data.ncols(), "variants");
    let records: Result<Vec<SignificanceRecord>> = data
        .values
        .axis_iter(Axis(1))
        .into_par_iter()
        .zip(data.columns.par_iter())
        .map(|(column, variant)| {
            let p = contingency_p_value(column, &data.labels, variant)?;
            bar.inc(1);
            Ok(SignificanceRecord {
                pval: if p <= 0.0 { P_FLOOR } else { p },
                variant: variant.clone(),
            })
        })
        .collect();
    bar.finish_and_clear();
    let records = records?;

    let significant = records.iter().filter(|r| r.pval < ALPHA).count();
    info!("Significant: {}", significant);
    info!("Not significant: {}", records.len() - significant);
    Ok(records)
}

pub fn write_significance(path: &Path, records: &[SignificanceRecord]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(["pval", "Variants"])?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!("Wrote {} p-values to {}", records.len(), path.display());
    Ok(())
}

/// Variant → p-value lookup from a `pval,Variants` table.
pub fn read_significance(path: &Path) -> Result<HashMap<String, f64>> {
    if !path.exists() {
        return Err(PipelineError::MissingArtifact {
            path: path.to_path_buf(),
            hint: "run the chi-squared test first".to_string(),
        });
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut lookup = HashMap::new();
    for record in reader.deserialize() {
        let record: SignificanceRecord = record?;
        lookup.insert(record.variant, record.pval);
    }
    Ok(lookup)
}

fn central_moments(values: &[f64]) -> (f64, f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for &v in values {
        let d = v - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    (m2 / n, m3 / n, m4 / n)
}

fn skew_z(skewness: f64, n: f64) -> f64 {
    let y = skewness * (((n + 1.0) * (n + 3.0)) / (6.0 * (n - 2.0))).sqrt();
    let beta2 = (3.0 * (n * n + 27.0 * n - 70.0) * (n + 1.0) * (n + 3.0))
        / ((n - 2.0) * (n + 5.0) * (n + 7.0) * (n + 9.0));
    let w2 = -1.0 + (2.0 * (beta2 - 1.0)).sqrt();
    let delta = 1.0 / (0.5 * w2.ln()).sqrt();
    let alpha = (2.0 / (w2 - 1.0)).sqrt();
    let y = if y == 0.0 { 1.0 } else { y };
    delta * (y / alpha + ((y / alpha).powi(2) + 1.0).sqrt()).ln()
}

fn kurtosis_z(kurtosis: f64, n: f64) -> f64 {
    let expected = 3.0 * (n - 1.0) / (n + 1.0);
    let variance = 24.0 * n * (n - 2.0) * (n - 3.0) / ((n + 1.0) * (n + 1.0) * (n + 3.0) * (n + 5.0));
    let x = (kurtosis - expected) / variance.sqrt();
    let sqrt_beta1 = 6.0 * (n * n - 5.0 * n + 2.0) / ((n + 7.0) * (n + 9.0))
        * ((6.0 * (n + 3.0) * (n + 5.0)) / (n * (n - 2.0) * (n - 3.0))).sqrt();
    let a = 6.0 + 8.0 / sqrt_beta1 * (2.0 / sqrt_beta1 + (1.0 + 4.0 / (sqrt_beta1 * sqrt_beta1)).sqrt());
    let term1 = 1.0 - 2.0 / (9.0 * a);
    let denom = 1.0 + x * (2.0 / (a - 4.0)).sqrt();
    if denom == 0.0 {
        return f64::NAN;
    }
    let term2 = denom.signum() * ((1.0 - 2.0 / a) / denom.abs()).cbrt();
    (term1 - term2) / (2.0 / (9.0 * a)).sqrt()
}

/// D'Agostino–Pearson K² p-value. Any missing cell or a constant column gives
/// NaN; fewer than eight observations is an error.
pub fn normality_p_value(column: ArrayView1<f64>, variant: &str) -> Result<f64> {
    if column.len() < MIN_NORMALITY_OBSERVATIONS {
        return Err(PipelineError::Statistics {
            variant: variant.to_string(),
            message: format!(
                "normality test needs at least {} observations, got {}",
                MIN_NORMALITY_OBSERVATIONS,
                column.len()
            ),
        });
    }
    if column.iter().any(|v| v.is_nan()) {
        return Ok(f64::NAN);
    }
    let values: Vec<f64> = column.to_vec();
    let (m2, m3, m4) = central_moments(&values);
    if m2 == 0.0 {
        return Ok(f64::NAN);
    }
    let n = values.len() as f64;
    let zs = skew_z(m3 / m2.powf(1.5), n);
    let zk = kurtosis_z(m4 / (m2 * m2), n);
    let k2 = zs * zs + zk * zk;
    if k2.is_nan() {
        return Ok(f64::NAN);
    }
    chi_squared_sf(k2, 2, variant)
}

#[derive(Clone, Debug, Default)]
pub struct NormalityReport {
    pub not_normal: Vec<NormalityRecord>,
    pub normal: usize,
    pub undefined: usize,
}

/// Normality test of every column; variants with p < 0.05 are non-normal.
pub fn normality_test(data: &FeatureMatrix) -> Result<NormalityReport> {
    info!("Testing normality of {} variants...", data.ncols());
    let bar = progress_bar(data.ncols(), "variants");
    let pvalues: Result<Vec<f64>> = data
        .values
        .axis_iter(Axis(1))
        .into_par_iter()
        .zip(data.columns.par_iter())
        .map(|(column, variant)| {
            let p = normality_p_value(column, variant);
            bar.inc(1);
            p
        })
        .collect();
    bar.finish_and_clear();

    let mut report = NormalityReport::default();
    for (p, variant) in pvalues?.into_iter().zip(&data.columns) {
        if p.is_nan() {
            report.undefined += 1;
        } else if p < ALPHA {
            report.not_normal.push(NormalityRecord {
                variant: variant.clone(),
                pval: if p <= 0.0 { P_FLOOR } else { p },
            });
        } else {
            report.normal += 1;
        }
    }
    info!("Normal: {}", report.normal);
    info!("Not normal: {}", report.not_normal.len());
    if report.undefined > 0 {
        warn!(
            "{} variants have no defined normality p-value (constant or incomplete columns).",
            report.undefined
        );
    }
    Ok(report)
}

pub fn write_non_normal(path: &Path, report: &NormalityReport) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(["Variant", "pval"])?;
    for record in &report.not_normal {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!(
        "Wrote {} non-normal variants to {}",
        report.not_normal.len(),
        path.display()
    );
    Ok(())
}
