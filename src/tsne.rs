// tsne.rs

use log::debug;
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

const PERPLEXITY_STEPS: usize = 100;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const CHECK_EVERY: usize = 50;

/// Optimiser settings for the exact one-dimensional embedding.
#[derive(Clone, Debug)]
pub struct TsneParams {
    pub perplexity: f64,
    pub early_exaggeration: f64,
    pub exaggeration_iters: usize,
    pub max_iter: usize,
    pub min_gain: f64,
    pub min_grad_norm: f64,
    pub init_scale: f64,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            early_exaggeration: 12.0,
            exaggeration_iters: 250,
            max_iter: 1000,
            min_gain: 0.01,
            min_grad_norm: 1e-7,
            init_scale: 1e-4,
        }
    }
}

impl TsneParams {
    /// Perplexity usable with `n` points.
    fn effective_perplexity(&self, n: usize) -> f64 {
        self.perplexity.min((n as f64 - 1.0) / 3.0).max(1.0)
    }

    fn learning_rate(&self, n: usize) -> f64 {
        (n as f64 / self.early_exaggeration / 4.0).max(50.0)
    }
}

fn squared_distances(block: ArrayView2<f64>) -> Array2<f64> {
    let n = block.nrows();
    let mut d = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let dist: f64 = block
                .row(i)
                .iter()
                .zip(block.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            d[[i, j]] = dist;
            d[[j, i]] = dist;
        }
    }
    d
}

/// Conditional affinities with a per-point bandwidth matching `perplexity`,
/// symmetrised into joint probabilities.
fn joint_probabilities(distances: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = distances.nrows();
    let target = perplexity.ln();
    let mut conditional = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        let mut beta = 1.0;
        let mut beta_min = f64::NEG_INFINITY;
        let mut beta_max = f64::INFINITY;
        for _ in 0..PERPLEXITY_STEPS {
            let mut sum = 0.0;
            for j in 0..n {
                let p = if i == j { 0.0 } else { (-distances[[i, j]] * beta).exp() };
                conditional[[i, j]] = p;
                sum += p;
            }
            let sum = sum.max(1e-8);
            let mut weighted = 0.0;
            for j in 0..n {
                conditional[[i, j]] /= sum;
                weighted += distances[[i, j]] * conditional[[i, j]];
            }
            let diff = sum.ln() + beta * weighted - target;
            if diff.abs() <= PERPLEXITY_TOLERANCE {
                break;
            }
            if diff > 0.0 {
                beta_min = beta;
                beta = if beta_max.is_infinite() { beta * 2.0 } else { (beta + beta_max) / 2.0 };
            } else {
                beta_max = beta;
                beta = if beta_min.is_infinite() { beta / 2.0 } else { (beta + beta_min) / 2.0 };
            }
        }
    }

    let joint = &conditional + &conditional.t();
    let total = joint.sum().max(f64::EPSILON);
    joint.mapv(|p| (p / total).max(f64::EPSILON))
}

/// KL gradient for the current layout; also returns the divergence.
fn gradient(p: &Array2<f64>, y: &Array1<f64>, exaggeration: f64) -> (Array1<f64>, f64) {
    let n = y.len();
    let mut numerators = Array2::<f64>::zeros((n, n));
    let mut total = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = y[i] - y[j];
            let num = 1.0 / (1.0 + diff * diff);
            numerators[[i, j]] = num;
            numerators[[j, i]] = num;
            total += 2.0 * num;
        }
    }
    let total = total.max(f64::EPSILON);

    let mut grad = Array1::<f64>::zeros(n);
    let mut kl = 0.0;
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let pij = p[[i, j]] * exaggeration;
            let qij = (numerators[[i, j]] / total).max(f64::EPSILON);
            grad[i] += 4.0 * (pij - qij) * numerators[[i, j]] * (y[i] - y[j]);
            kl += pij * (pij.max(f64::EPSILON) / qij).ln();
        }
    }
    (grad, kl)
}

/// Exact t-SNE of the rows of `block` into one dimension.
///
/// Starts from a small Gaussian layout drawn from `rng`, runs the early
/// exaggeration phase with momentum 0.5, then the remaining iterations with
/// momentum 0.8, using per-coordinate adaptive gains.
pub fn embed_1d<R: Rng>(block: ArrayView2<f64>, params: &TsneParams, rng: &mut R) -> Array1<f64> {
    let n = block.nrows();
    if n <= 1 {
        return Array1::zeros(n);
    }

    let perplexity = params.effective_perplexity(n);
    let p = joint_probabilities(&squared_distances(block), perplexity);
    let learning_rate = params.learning_rate(n);

    let mut y: Array1<f64> = (0..n)
        .map(|_| params.init_scale * rng.sample::<f64, _>(StandardNormal))
        .collect();
    let mut update = Array1::<f64>::zeros(n);
    let mut gains = Array1::<f64>::ones(n);
    let mut kl = f64::NAN;

    for iter in 0..params.max_iter {
        let (exaggeration, momentum) = if iter < params.exaggeration_iters {
            (params.early_exaggeration, 0.5)
        } else {
            (1.0, 0.8)
        };
        let (grad, divergence) = gradient(&p, &y, exaggeration);
        kl = divergence;

        for i in 0..n {
            gains[i] = if update[i] * grad[i] < 0.0 {
                gains[i] + 0.2
            } else {
                (gains[i] * 0.8).max(params.min_gain)
            };
            update[i] = momentum * update[i] - learning_rate * gains[i] * grad[i];
            y[i] += update[i];
        }

        if (iter + 1) % CHECK_EVERY == 0 {
            let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
            if norm < params.min_grad_norm && iter >= params.exaggeration_iters {
                debug!("t-SNE converged at iteration {} (gradient norm {:.3e}).", iter + 1, norm);
                break;
            }
        }
    }
    debug!("t-SNE on {} points: perplexity {:.1}, final KL {:.5}.", n, perplexity, kl);
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn degenerate_inputs_give_zeros() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let one = array![[1.0, 2.0]];
        assert_eq!(embed_1d(one.view(), &TsneParams::default(), &mut rng), array![0.0]);
        let none = Array2::<f64>::zeros((0, 3));
        assert_eq!(embed_1d(none.view(), &TsneParams::default(), &mut rng).len(), 0);
    }

    #[test]
    fn joint_probabilities_are_symmetric_and_normalised() {
        let block = array![[0.0], [1.0], [3.0], [7.0]];
        let p = joint_probabilities(&squared_distances(block.view()), 1.0);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        for i in 0..4 {
            for j in 0..4 {
                assert!((p[[i, j]] - p[[j, i]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn same_seed_same_embedding() {
        let block = array![[0.0, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0], [10.0, 0.0], [10.1, 0.1]];
        let params = TsneParams {
            max_iter: 300,
            ..TsneParams::default()
        };
        let a = embed_1d(block.view(), &params, &mut ChaCha8Rng::seed_from_u64(7));
        let b = embed_1d(block.view(), &params, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn close_points_stay_closer_than_far_points() {
        let block = array![[0.0], [0.05], [20.0], [20.05], [40.0], [40.05]];
        let y = embed_1d(block.view(), &TsneParams::default(), &mut ChaCha8Rng::seed_from_u64(3));
        let near = (y[0] - y[1]).abs();
        let far = (y[0] - y[2]).abs().min((y[0] - y[4]).abs());
        assert!(near < far, "near {} far {}", near, far);
    }
}
