use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::dataset::Batch;
use super::error::ClassifierError;
use crate::runtime::Device;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    /// Embedding bag straight into the label logits
    #[default]
    Linear,
    /// Embedding bag, one ReLU hidden layer with dropout, output layer
    Mlp,
}

/// How feature embeddings of one sample are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BagMode {
    #[default]
    Sum,
    Mean,
}

/// Model hyperparameters stored alongside the weights in every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub mode: ModelMode,
    /// Width of the embedding bag in `Mlp` mode
    pub embed_dim: usize,
    pub hidden_dim: usize,
    pub dropout: f32,
    pub bag_mode: BagMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            mode: ModelMode::Linear,
            embed_dim: 256,
            hidden_dim: 256,
            dropout: 0.15,
            bag_mode: BagMode::Sum,
        }
    }
}

impl ModelConfig {
    pub fn mlp() -> Self {
        Self {
            mode: ModelMode::Mlp,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ModelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_embed_dim(mut self, embed_dim: usize) -> Self {
        self.embed_dim = embed_dim;
        self
    }

    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_bag_mode(mut self, bag_mode: BagMode) -> Self {
        self.bag_mode = bag_mode;
        self
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.mode == ModelMode::Mlp {
            if self.embed_dim == 0 || self.hidden_dim == 0 {
                return Err(ClassifierError::ValidationError(
                    "embed_dim and hidden_dim must be positive".into(),
                ));
            }
            if !(0.0..1.0).contains(&self.dropout) {
                return Err(ClassifierError::ValidationError(format!(
                    "dropout must be in [0, 1), got {}",
                    self.dropout
                )));
            }
        }
        Ok(())
    }
}

/// Dense layers of the `Mlp` variant. The output bias lives in
/// [`Weights::bias`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenLayers {
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    pub w2: Array2<f32>,
}

/// Trainable parameters: the `feature_dim × width` embedding matrix, the
/// output bias, and optionally the hidden layers.
///
/// Gradients and optimizer moments use the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub embedding: Array2<f32>,
    pub bias: Array1<f32>,
    pub hidden: Option<HiddenLayers>,
}

impl Weights {
    pub fn zeros_like(&self) -> Self {
        Self {
            embedding: Array2::zeros(self.embedding.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
            hidden: self.hidden.as_ref().map(|h| HiddenLayers {
                w1: Array2::zeros(h.w1.raw_dim()),
                b1: Array1::zeros(h.b1.raw_dim()),
                w2: Array2::zeros(h.w2.raw_dim()),
            }),
        }
    }

    pub fn fill(&mut self, value: f32) {
        for mut tensor in self.tensors_mut() {
            tensor.fill(value);
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    pub(crate) fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = vec![self.embedding.view().into_dyn(), self.bias.view().into_dyn()];
        if let Some(h) = &self.hidden {
            out.push(h.w1.view().into_dyn());
            out.push(h.b1.view().into_dyn());
            out.push(h.w2.view().into_dyn());
        }
        out
    }

    pub(crate) fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = vec![self.embedding.view_mut().into_dyn(), self.bias.view_mut().into_dyn()];
        if let Some(h) = &mut self.hidden {
            out.push(h.w1.view_mut().into_dyn());
            out.push(h.b1.view_mut().into_dyn());
            out.push(h.w2.view_mut().into_dyn());
        }
        out
    }
}

/// Intermediate activations kept by a training forward pass.
#[derive(Debug)]
pub(crate) struct ForwardCache {
    pooled: Array2<f32>,
    hidden: Option<HiddenCache>,
}

#[derive(Debug)]
struct HiddenCache {
    pre_activation: Array2<f32>,
    /// ReLU output after dropout
    activation: Array2<f32>,
    mask: Option<Array2<f32>>,
}

/// Sum-pooled hashed-embedding multi-label model.
///
/// `forward(features, offsets)` returns raw logits of shape
/// `(samples, output_dim)`; callers apply the sigmoid.
#[derive(Debug, Clone)]
pub struct HashedMultilabelModel {
    config: ModelConfig,
    feature_dim: usize,
    output_dim: usize,
    device: Device,
    weights: Weights,
}

impl HashedMultilabelModel {
    /// Creates a Xavier-initialised model with zero biases.
    pub fn new(
        feature_dim: usize,
        output_dim: usize,
        config: ModelConfig,
        device: Device,
        seed: u64,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        if feature_dim == 0 || output_dim == 0 {
            return Err(ClassifierError::ValidationError(format!(
                "feature_dim and output_dim must be positive (got {} and {})",
                feature_dim, output_dim
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let weights = match config.mode {
            ModelMode::Linear => Weights {
                embedding: xavier_uniform(feature_dim, output_dim, &mut rng),
                bias: Array1::zeros(output_dim),
                hidden: None,
            },
            ModelMode::Mlp => Weights {
                embedding: xavier_uniform(feature_dim, config.embed_dim, &mut rng),
                bias: Array1::zeros(output_dim),
                hidden: Some(HiddenLayers {
                    w1: xavier_uniform(config.embed_dim, config.hidden_dim, &mut rng),
                    b1: Array1::zeros(config.hidden_dim),
                    w2: xavier_uniform(config.hidden_dim, output_dim, &mut rng),
                }),
            },
        };

        Ok(Self {
            config,
            feature_dim,
            output_dim,
            device,
            weights,
        })
    }

    /// Rebuilds a model from stored weights, checking every shape.
    pub fn from_weights(
        feature_dim: usize,
        output_dim: usize,
        config: ModelConfig,
        device: Device,
        weights: Weights,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        let width = match config.mode {
            ModelMode::Linear => output_dim,
            ModelMode::Mlp => config.embed_dim,
        };
        let shape_err = |what: &str| ClassifierError::ModelError(format!("Stored {} has the wrong shape", what));

        if weights.embedding.dim() != (feature_dim, width) {
            return Err(shape_err("embedding"));
        }
        if weights.bias.len() != output_dim {
            return Err(shape_err("bias"));
        }
        match (config.mode, &weights.hidden) {
            (ModelMode::Linear, None) => {}
            (ModelMode::Mlp, Some(h)) => {
                if h.w1.dim() != (config.embed_dim, config.hidden_dim)
                    || h.b1.len() != config.hidden_dim
                    || h.w2.dim() != (config.hidden_dim, output_dim)
                {
                    return Err(shape_err("hidden layer"));
                }
            }
            _ => {
                return Err(ClassifierError::ModelError(
                    "Stored weights do not match the model mode".into(),
                ))
            }
        }

        Ok(Self {
            config,
            feature_dim,
            output_dim,
            device,
            weights,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Weights {
        &mut self.weights
    }

    pub fn into_weights(self) -> Weights {
        self.weights
    }

    /// Inference forward pass; dropout is never applied here.
    pub fn forward(&self, features: &[u32], offsets: &[usize]) -> Result<Array2<f32>, ClassifierError> {
        self.check_inputs(features, offsets)?;
        let (logits, _) = self.forward_inner(features, offsets, None::<&mut StdRng>);
        Ok(logits)
    }

    pub fn forward_batch(&self, batch: &Batch) -> Result<Array2<f32>, ClassifierError> {
        self.forward(&batch.features, &batch.offsets)
    }

    /// Training forward pass; keeps activations and samples dropout masks.
    pub(crate) fn forward_train<R: Rng>(
        &self,
        batch: &Batch,
        rng: &mut R,
    ) -> Result<(Array2<f32>, ForwardCache), ClassifierError> {
        self.check_inputs(&batch.features, &batch.offsets)?;
        Ok(self.forward_inner(&batch.features, &batch.offsets, Some(rng)))
    }

    /// Accumulates the gradient of the loss w.r.t. every parameter into
    /// `grads`, given `d_logits` for the batch.
    pub(crate) fn backward(
        &self,
        batch: &Batch,
        cache: &ForwardCache,
        d_logits: ArrayView2<f32>,
        grads: &mut Weights,
    ) -> Result<(), ClassifierError> {
        if d_logits.nrows() != cache.pooled.nrows() || d_logits.ncols() != self.output_dim {
            return Err(ClassifierError::ModelError(format!(
                "Gradient shape {:?} does not match logits ({}, {})",
                d_logits.dim(),
                cache.pooled.nrows(),
                self.output_dim
            )));
        }

        grads.bias += &d_logits.sum_axis(Axis(0));

        let d_pooled = match (&self.weights.hidden, &cache.hidden, &mut grads.hidden) {
            (None, None, None) => d_logits.to_owned(),
            (Some(layers), Some(hc), Some(g)) => {
                g.w2 += &hc.activation.t().dot(&d_logits);
                let mut d_hidden = d_logits.dot(&layers.w2.t());
                if let Some(mask) = &hc.mask {
                    d_hidden *= mask;
                }
                d_hidden.zip_mut_with(&hc.pre_activation, |d, &z| {
                    if z <= 0.0 {
                        *d = 0.0;
                    }
                });
                g.b1 += &d_hidden.sum_axis(Axis(0));
                g.w1 += &cache.pooled.t().dot(&d_hidden);
                d_hidden.dot(&layers.w1.t())
            }
            _ => {
                return Err(ClassifierError::ModelError(
                    "Gradient buffers do not match the model layout".into(),
                ))
            }
        };

        let bag_mode = self.config.bag_mode;
        for (i, (start, end)) in spans(&batch.offsets, batch.features.len()).enumerate() {
            if end <= start {
                continue;
            }
            let scale = match bag_mode {
                BagMode::Sum => 1.0,
                BagMode::Mean => 1.0 / (end - start) as f32,
            };
            let d_row = d_pooled.row(i);
            for &feature in &batch.features[start..end] {
                grads
                    .embedding
                    .row_mut(feature as usize)
                    .scaled_add(scale, &d_row);
            }
        }

        Ok(())
    }

    fn forward_inner<R: Rng>(
        &self,
        features: &[u32],
        offsets: &[usize],
        rng: Option<&mut R>,
    ) -> (Array2<f32>, ForwardCache) {
        let pooled = bag(self.weights.embedding.view(), features, offsets, self.config.bag_mode);

        match &self.weights.hidden {
            None => {
                let mut logits = pooled.clone();
                logits += &self.weights.bias;
                (logits, ForwardCache { pooled, hidden: None })
            }
            Some(layers) => {
                let mut pre_activation = pooled.dot(&layers.w1);
                pre_activation += &layers.b1;
                let mut activation = pre_activation.mapv(|z| z.max(0.0));

                let mask = match rng {
                    Some(rng) if self.config.dropout > 0.0 => {
                        let keep = 1.0 - self.config.dropout;
                        let mask = Array2::from_shape_fn(activation.raw_dim(), |_| {
                            if rng.gen::<f32>() < self.config.dropout {
                                0.0
                            } else {
                                1.0 / keep
                            }
                        });
                        activation *= &mask;
                        Some(mask)
                    }
                    _ => None,
                };

                let mut logits = activation.dot(&layers.w2);
                logits += &self.weights.bias;
                (
                    logits,
                    ForwardCache {
                        pooled,
                        hidden: Some(HiddenCache {
                            pre_activation,
                            activation,
                            mask,
                        }),
                    },
                )
            }
        }
    }

    fn check_inputs(&self, features: &[u32], offsets: &[usize]) -> Result<(), ClassifierError> {
        if offsets.is_empty() {
            return Err(ClassifierError::ModelError("Offsets must not be empty".into()));
        }
        if offsets[0] != 0 {
            return Err(ClassifierError::ModelError("First offset must be 0".into()));
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) || offsets[offsets.len() - 1] > features.len() {
            return Err(ClassifierError::ModelError(
                "Offsets must be non-decreasing and within the feature array".into(),
            ));
        }
        if let Some(&bad) = features.iter().find(|&&f| f as usize >= self.feature_dim) {
            return Err(ClassifierError::ModelError(format!(
                "Feature index {} out of range for feature_dim {}",
                bad, self.feature_dim
            )));
        }
        Ok(())
    }
}

/// `(start, end)` of every sample; the last sample runs to `len`.
fn spans(offsets: &[usize], len: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
    offsets
        .iter()
        .enumerate()
        .map(move |(i, &start)| (start, offsets.get(i + 1).copied().unwrap_or(len)))
}

fn bag(embedding: ArrayView2<f32>, features: &[u32], offsets: &[usize], mode: BagMode) -> Array2<f32> {
    let mut pooled = Array2::zeros((offsets.len(), embedding.ncols()));
    for (i, (start, end)) in spans(offsets, features.len()).enumerate() {
        let mut row = pooled.row_mut(i);
        for &feature in &features[start..end] {
            row += &embedding.row(feature as usize);
        }
        if mode == BagMode::Mean && end > start {
            row /= (end - start) as f32;
        }
    }
    pooled
}

fn xavier_uniform<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let bound = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}
