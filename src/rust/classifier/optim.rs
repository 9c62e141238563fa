use ndarray::Zip;
use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::model::Weights;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            weight_decay: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// AdamW with decoupled weight decay applied to every parameter tensor,
/// biases included.
///
/// Moments are dense and shaped like the model weights.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    first_moment: Weights,
    second_moment: Weights,
    step: i32,
}

impl AdamW {
    pub fn new(config: AdamWConfig, params: &Weights) -> Self {
        Self {
            config,
            first_moment: params.zeros_like(),
            second_moment: params.zeros_like(),
            step: 0,
        }
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn steps_taken(&self) -> i32 {
        self.step
    }

    /// Applies one update to `params` from `grads`.
    ///
    /// # Errors
    /// - `ModelError` if `grads` does not have the layout of `params`
    pub fn step(&mut self, params: &mut Weights, grads: &Weights) -> Result<(), ClassifierError> {
        let mut param_views = params.tensors_mut();
        let grad_views = grads.tensors();
        let mut m_views = self.first_moment.tensors_mut();
        let mut v_views = self.second_moment.tensors_mut();

        if param_views.len() != grad_views.len()
            || param_views.len() != m_views.len()
            || param_views
                .iter()
                .zip(grad_views.iter())
                .any(|(p, g)| p.shape() != g.shape())
        {
            return Err(ClassifierError::ModelError(
                "Gradient layout does not match the parameters".into(),
            ));
        }

        self.step += 1;
        let AdamWConfig {
            learning_rate: lr,
            weight_decay,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.step);
        let bias_correction2_sqrt = (1.0 - beta2.powi(self.step)).sqrt();
        let step_size = lr / bias_correction1;
        let decay = 1.0 - lr * weight_decay;

        for (((param, grad), m), v) in param_views
            .iter_mut()
            .zip(grad_views.iter())
            .zip(m_views.iter_mut())
            .zip(v_views.iter_mut())
        {
            Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bias_correction2_sqrt + epsilon;
                *p -= step_size * *m / denom;
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    fn weights(embedding: Array2<f32>, bias: Array1<f32>) -> Weights {
        Weights {
            embedding,
            bias,
            hidden: None,
        }
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut params = weights(array![[1.0, -1.0]], array![0.0, 0.0]);
        let grads = weights(array![[0.5, -2.0]], array![1.0, 0.0]);
        let config = AdamWConfig {
            weight_decay: 0.0,
            ..AdamWConfig::default()
        };
        let mut optimizer = AdamW::new(config, &params);
        optimizer.step(&mut params, &grads).unwrap();

        // bias-corrected first step is lr * sign(g)
        assert!((params.embedding[[0, 0]] - 0.95).abs() < 1e-5);
        assert!((params.embedding[[0, 1]] + 0.95).abs() < 1e-5);
        assert!((params.bias[0] + 0.05).abs() < 1e-5);
        assert_eq!(params.bias[1], 0.0);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn test_decoupled_weight_decay() {
        let mut params = weights(array![[2.0]], array![0.0]);
        let grads = params.zeros_like();
        let config = AdamWConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            ..AdamWConfig::default()
        };
        let mut optimizer = AdamW::new(config, &params);
        optimizer.step(&mut params, &grads).unwrap();
        assert!((params.embedding[[0, 0]] - 2.0 * (1.0 - 0.05)).abs() < 1e-6);
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let mut params = weights(array![[1.0, 2.0]], array![0.0]);
        let grads = weights(array![[1.0]], array![0.0]);
        let mut optimizer = AdamW::new(AdamWConfig::default(), &params);
        assert!(optimizer.step(&mut params, &grads).is_err());
    }
}
