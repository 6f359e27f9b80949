// missing.rs

use crate::error::{PipelineError, Result};
use crate::matrix::{DatasetTag, FeatureMatrix, Stage};
use log::{debug, info, warn};
use ndarray::{ArrayView1, Axis};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Drops every column whose missing share, as a percentage of rows, is
/// strictly greater than `percentage`. Labels are never considered.
/// Column order is preserved.
pub fn clean_missing(data: &FeatureMatrix, percentage: f64) -> Result<FeatureMatrix> {
    if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
        return Err(PipelineError::ParameterOutOfRange {
            name: "percentage",
            value: percentage,
            expected: "a value between 0 and 100",
        });
    }
    let rows = data.nrows() as f64;
    let keep: Vec<bool> = data
        .values
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| {
            let missing = column.iter().filter(|v| v.is_nan()).count() as f64;
            // missing / rows * 100 > percentage, without the division
            missing * 100.0 <= percentage * rows
        })
        .collect();
    let kept: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(i, &k)| k.then_some(i))
        .collect();
    info!(
        "Missing-data cleanup at {}%: deleted {} of {} columns.",
        percentage,
        data.ncols() - kept.len(),
        data.ncols()
    );
    Ok(data
        .select_columns(&kept)
        .with_tag(DatasetTag::new(Stage::Cleaned)))
}

/// Per-column fill rule for missing cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImputeStrategy {
    Mean,
    Median,
    MostFrequent,
}

impl FromStr for ImputeStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(ImputeStrategy::Mean),
            "median" => Ok(ImputeStrategy::Median),
            "most_frequent" => Ok(ImputeStrategy::MostFrequent),
            other => Err(PipelineError::UnsupportedStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for ImputeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImputeStrategy::Mean => write!(f, "mean"),
            ImputeStrategy::Median => write!(f, "median"),
            ImputeStrategy::MostFrequent => write!(f, "most_frequent"),
        }
    }
}

impl ImputeStrategy {
    /// Fill value fitted on the observed cells of one column; `None` when the
    /// column has no observed cell.
    pub fn fit(&self, column: ArrayView1<f64>) -> Option<f64> {
        let mut observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        if observed.is_empty() {
            return None;
        }
        match self {
            ImputeStrategy::Mean => Some(observed.iter().sum::<f64>() / observed.len() as f64),
            ImputeStrategy::Median => {
                observed.sort_by(|a, b| a.total_cmp(b));
                let mid = observed.len() / 2;
                if observed.len() % 2 == 0 {
                    Some((observed[mid - 1] + observed[mid]) / 2.0)
                } else {
                    Some(observed[mid])
                }
            }
            ImputeStrategy::MostFrequent => {
                observed.sort_by(|a, b| a.total_cmp(b));
                // runs are ascending, so the first longest run is the smallest mode
                let mut best = (observed[0], 0usize);
                let mut run = (observed[0], 0usize);
                for &v in &observed {
                    if v == run.0 {
                        run.1 += 1;
                    } else {
                        run = (v, 1);
                    }
                    if run.1 > best.1 {
                        best = run;
                    }
                }
                Some(best.0)
            }
        }
    }
}

/// Fills missing cells column by column. Columns with no observed value
/// cannot be fitted and are dropped with a warning. Labels are untouched.
pub fn impute(data: &FeatureMatrix, strategy: ImputeStrategy) -> Result<FeatureMatrix> {
    let fills: Vec<Option<f64>> = data
        .values
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| strategy.fit(column))
        .collect();

    let fitted: Vec<usize> = fills
        .iter()
        .enumerate()
        .filter_map(|(i, fill)| fill.map(|_| i))
        .collect();
    if fitted.len() < fills.len() {
        warn!(
            "Skipping {} columns with no observed values during '{}' imputation.",
            fills.len() - fitted.len(),
            strategy
        );
    }

    let mut imputed = data.select_columns(&fitted);
    let mut filled = 0usize;
    for (mut column, fill) in imputed
        .values
        .axis_iter_mut(Axis(1))
        .zip(fitted.iter().filter_map(|&i| fills[i]))
    {
        for cell in column.iter_mut().filter(|c| c.is_nan()) {
            *cell = fill;
            filled += 1;
        }
    }
    debug!("Filled {} missing cells.", filled);
    info!(
        "Imputation ({}): {} columns retained, {} cells filled.",
        strategy,
        imputed.ncols(),
        filled
    );
    Ok(imputed.with_tag(DatasetTag::new(Stage::Imputed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn matrix(values: Array2<f64>) -> FeatureMatrix {
        let rows = values.nrows();
        let columns = (0..values.ncols()).map(|i| format!("c{}", i)).collect();
        FeatureMatrix::new(
            (0..rows).map(|i| i.to_string()).collect(),
            columns,
            values,
            vec![0; rows],
            DatasetTag::new(Stage::Merged),
        )
        .unwrap()
    }

    #[test]
    fn column_over_threshold_is_dropped_others_kept_unchanged() {
        let mut values = Array2::<f64>::from_elem((10, 3), 1.0);
        for r in 0..6 {
            values[[r, 0]] = f64::NAN;
        }
        values[[0, 2]] = f64::NAN;
        let data = matrix(values.clone());
        let cleaned = clean_missing(&data, 50.0).unwrap();
        assert_eq!(cleaned.columns, vec!["c1", "c2"]);
        assert_eq!(cleaned.values.column(0), values.column(1));
        assert!(cleaned.values[[0, 1]].is_nan());
        assert_eq!(cleaned.tag.stage, Stage::Cleaned);
    }

    #[test]
    fn threshold_boundary_is_strict() {
        let mut values = Array2::<f64>::zeros((10, 2));
        for r in 0..3 {
            values[[r, 0]] = f64::NAN;
        }
        for r in 0..4 {
            values[[r, 1]] = f64::NAN;
        }
        let cleaned = clean_missing(&matrix(values), 30.0).unwrap();
        assert_eq!(cleaned.columns, vec!["c0"]);
    }

    #[test]
    fn out_of_range_percentage_is_rejected() {
        let data = matrix(array![[1.0]]);
        for bad in [-0.1, 100.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                clean_missing(&data, bad),
                Err(PipelineError::ParameterOutOfRange { .. })
            ));
        }
        assert!(clean_missing(&data, 0.0).is_ok());
        assert!(clean_missing(&data, 100.0).is_ok());
    }

    #[test]
    fn unknown_strategy_keyword_is_an_error() {
        assert_eq!("median".parse::<ImputeStrategy>().unwrap(), ImputeStrategy::Median);
        match "constant".parse::<ImputeStrategy>() {
            Err(PipelineError::UnsupportedStrategy(keyword)) => assert_eq!(keyword, "constant"),
            other => panic!("expected UnsupportedStrategy, got {:?}", other),
        }
    }

    #[test]
    fn strategies_fit_per_column() {
        let column = array![1.0, f64::NAN, 3.0, 3.0, 10.0];
        assert_eq!(ImputeStrategy::Mean.fit(column.view()), Some(4.25));
        assert_eq!(ImputeStrategy::Median.fit(column.view()), Some(3.0));
        assert_eq!(ImputeStrategy::MostFrequent.fit(column.view()), Some(3.0));
        let ties = array![2.0, 1.0, f64::NAN, 2.0, 1.0];
        assert_eq!(ImputeStrategy::MostFrequent.fit(ties.view()), Some(1.0));
        assert_eq!(ImputeStrategy::Median.fit(ties.view()), Some(1.5));
        assert_eq!(ImputeStrategy::Mean.fit(array![f64::NAN].view()), None);
    }

    #[test]
    fn impute_fills_only_missing_cells_and_drops_empty_columns() {
        let data = matrix(array![
            [1.0, f64::NAN, 0.0],
            [f64::NAN, f64::NAN, 2.0],
            [3.0, f64::NAN, f64::NAN]
        ]);
        let imputed = impute(&data, ImputeStrategy::Mean).unwrap();
        assert_eq!(imputed.columns, vec!["c0", "c2"]);
        assert_eq!(imputed.values, array![[1.0, 0.0], [2.0, 2.0], [3.0, 1.0]]);
        assert_eq!(imputed.labels, data.labels);
    }
}
