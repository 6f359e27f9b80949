// pca.rs

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{error::LinalgError, Eigh, UPLO};

/// Leading eigenpair of a symmetric matrix. `eigh` returns eigenvalues in
/// ascending order, so the last one is the largest.
fn leading_eigenpair(symmetric: &Array2<f64>) -> Result<(f64, Array1<f64>), LinalgError> {
    let (values, vectors): (Array1<f64>, Array2<f64>) = symmetric.eigh(UPLO::Lower)?;
    let top = values.len() - 1;
    Ok((values[top], vectors.column(top).to_owned()))
}

/// Projection of every row of `block` onto its first principal axis.
///
/// Columns are centred; the axis comes from the covariance matrix or the Gram
/// matrix, whichever is smaller. The sign is fixed so the loading with the
/// largest magnitude is positive. Constant data projects to zero.
pub fn first_component(block: ArrayView2<f64>) -> Result<Array1<f64>, LinalgError> {
    let (rows, cols) = block.dim();
    if rows == 0 || cols == 0 {
        return Ok(Array1::zeros(rows));
    }
    let means = block.sum_axis(Axis(0)) / rows as f64;
    let centred = &block - &means.insert_axis(Axis(0));
    let scale: f64 = centred.iter().map(|x| x * x).sum();
    if scale == 0.0 {
        return Ok(Array1::zeros(rows));
    }

    let loadings = if cols <= rows {
        leading_eigenpair(&centred.t().dot(&centred))?.1
    } else {
        let (value, vector) = leading_eigenpair(&centred.dot(&centred.t()))?;
        if value <= f64::EPSILON * scale {
            return Ok(Array1::zeros(rows));
        }
        centred.t().dot(&vector) / value.sqrt()
    };

    let mut pivot = 0;
    for (i, &l) in loadings.iter().enumerate() {
        if l.abs() > loadings[pivot].abs() {
            pivot = i;
        }
    }
    let scores = centred.dot(&loadings);
    Ok(if loadings[pivot] < 0.0 { -scores } else { scores })
}
