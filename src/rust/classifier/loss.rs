use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

use super::error::ClassifierError;

/// Per-label positive weight `negatives / positives`, clamped to
/// `[1, clamp_max]`.
///
/// Labels without any positive get weight 1. An empty target matrix yields
/// all ones.
pub fn compute_pos_weight(targets: ArrayView2<f32>, clamp_max: f32) -> Array1<f32> {
    let rows = targets.nrows() as f32;
    let upper = clamp_max.max(1.0);
    if targets.nrows() == 0 {
        return Array1::ones(targets.ncols());
    }

    targets.sum_axis(Axis(0)).mapv(|positives| {
        if positives <= 0.0 {
            1.0
        } else {
            ((rows - positives) / positives).max(1.0).min(upper)
        }
    })
}

/// Binary cross-entropy with logits, positives scaled by `pos_weight`,
/// averaged over every (sample, label) cell.
#[derive(Debug, Clone)]
pub struct WeightedBceLoss {
    pos_weight: Array1<f32>,
}

impl WeightedBceLoss {
    pub fn new(pos_weight: Array1<f32>) -> Self {
        Self { pos_weight }
    }

    /// Unweighted loss over `output_dim` labels.
    pub fn unweighted(output_dim: usize) -> Self {
        Self::new(Array1::ones(output_dim))
    }

    pub fn pos_weight(&self) -> &Array1<f32> {
        &self.pos_weight
    }

    pub fn loss(&self, logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<f32, ClassifierError> {
        self.loss_and_grad(logits, targets).map(|(loss, _)| loss)
    }

    /// Returns the mean loss and its gradient w.r.t. `logits`.
    ///
    /// # Errors
    /// - `ModelError` if the shapes of `logits`, `targets` and the weight
    ///   vector disagree
    pub fn loss_and_grad(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<(f32, Array2<f32>), ClassifierError> {
        if logits.dim() != targets.dim() || logits.ncols() != self.pos_weight.len() {
            return Err(ClassifierError::ModelError(format!(
                "Loss shapes disagree: logits {:?}, targets {:?}, pos_weight {}",
                logits.dim(),
                targets.dim(),
                self.pos_weight.len()
            )));
        }

        let cells = logits.len();
        if cells == 0 {
            return Ok((0.0, Array2::zeros(logits.raw_dim())));
        }
        let scale = 1.0 / cells as f32;

        let mut grad = Array2::zeros(logits.raw_dim());
        let mut total = 0.0f64;
        for ((row, col), &x) in logits.indexed_iter() {
            let y = targets[[row, col]];
            let log_weight = (self.pos_weight[col] - 1.0) * y + 1.0;
            // log(1 + e^-x) written so neither branch overflows
            let softplus_neg = (-x.abs()).exp().ln_1p() + (-x).max(0.0);
            total += f64::from((1.0 - y) * x + log_weight * softplus_neg);

            let p = super::utils::sigmoid(x);
            grad[[row, col]] = ((1.0 - y) + log_weight * (p - 1.0)) * scale;
        }

        Ok(((total / cells as f64) as f32, grad))
    }
}

/// Mean unweighted BCE, used for reporting.
pub fn mean_bce(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    if logits.is_empty() || logits.dim() != targets.dim() {
        return 0.0;
    }
    let mut total = 0.0f64;
    Zip::from(&logits).and(&targets).for_each(|&x, &y| {
        let softplus_neg = (-x.abs()).exp().ln_1p() + (-x).max(0.0);
        total += f64::from((1.0 - y) * x + softplus_neg);
    });
    (total / logits.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pos_weight_ratio_and_clamp() {
        // label 0: 1 positive of 4 -> 3; label 1: none -> 1; label 2: all -> 0 -> 1
        let targets = array![[1.0, 0.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        let weights = compute_pos_weight(targets.view(), 15.0);
        assert_eq!(weights, array![3.0, 1.0, 1.0]);

        let weights = compute_pos_weight(targets.view(), 2.0);
        assert_eq!(weights[0], 2.0);
    }

    #[test]
    fn test_pos_weight_empty_targets() {
        let targets = Array2::<f32>::zeros((0, 3));
        assert_eq!(compute_pos_weight(targets.view(), 15.0), Array1::<f32>::ones(3));
    }

    #[test]
    fn test_loss_at_zero_logits() {
        let loss = WeightedBceLoss::unweighted(2);
        let logits = Array2::zeros((1, 2));
        let targets = array![[1.0, 0.0]];
        let (value, grad) = loss.loss_and_grad(logits.view(), targets.view()).unwrap();
        assert!((value - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((grad[[0, 0]] + 0.25).abs() < 1e-6);
        assert!((grad[[0, 1]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_pos_weight_scales_positive_term() {
        let weighted = WeightedBceLoss::new(array![3.0]);
        let logits = array![[0.0]];
        let targets = array![[1.0]];
        let value = weighted.loss(logits.view(), targets.view()).unwrap();
        assert!((value - 3.0 * std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_loss_is_stable_for_large_logits() {
        let loss = WeightedBceLoss::unweighted(2);
        let logits = array![[80.0, -80.0]];
        let targets = array![[1.0, 0.0]];
        let value = loss.loss(logits.view(), targets.view()).unwrap();
        assert!(value.is_finite());
        assert!(value < 1e-6);
        let wrong = loss.loss(logits.view(), array![[0.0, 1.0]].view()).unwrap();
        assert!((wrong - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let loss = WeightedBceLoss::new(array![2.5, 1.0]);
        let targets = array![[1.0, 0.0], [0.0, 1.0]];
        let logits = array![[0.3, -1.2], [2.0, 0.7]];
        let (_, grad) = loss.loss_and_grad(logits.view(), targets.view()).unwrap();
        let eps = 1e-3;
        for ((r, c), &g) in grad.indexed_iter() {
            let mut plus = logits.clone();
            let mut minus = logits.clone();
            plus[[r, c]] += eps;
            minus[[r, c]] -= eps;
            let numeric = (loss.loss(plus.view(), targets.view()).unwrap()
                - loss.loss(minus.view(), targets.view()).unwrap())
                / (2.0 * eps);
            assert!((numeric - g).abs() < 1e-3, "({r},{c}) {numeric} vs {g}");
        }
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let loss = WeightedBceLoss::unweighted(3);
        let logits = Array2::zeros((1, 2));
        assert!(loss.loss(logits.view(), logits.view()).is_err());
    }
}
