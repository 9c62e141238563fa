use std::cmp::Ordering;
use std::fmt;

use log::{debug, info, warn};
use ndarray::{concatenate, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::dataset::{EncodeSummary, EncodedDataset, Row};
use super::error::ClassifierError;
use super::features::FeatureHasher;
use super::labels::LabelSpace;
use super::loss::{compute_pos_weight, WeightedBceLoss};
use super::metrics::{summarize, MetricsReport, Threshold};
use super::model::{HashedMultilabelModel, ModelConfig};
use super::optim::{AdamW, AdamWConfig};
use crate::runtime::{create_thread_pool, RuntimeConfig};

/// Hyperparameters of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub feature_dim: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub optimizer: AdamWConfig,
    /// Global threshold used for epoch metrics and stored in the artifact
    pub threshold: f32,
    /// Seeds initialisation, shuffling and dropout
    pub seed: u64,
    pub pos_weight_clamp: f32,
    /// Log a progress line every this many epochs
    pub log_every: usize,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            feature_dim: 32768,
            epochs: 40,
            batch_size: 32,
            optimizer: AdamWConfig::default(),
            threshold: 0.5,
            seed: 7,
            pos_weight_clamp: 15.0,
            log_every: 1,
            model: ModelConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn with_feature_dim(mut self, feature_dim: usize) -> Self {
        self.feature_dim = feature_dim;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.optimizer.learning_rate = learning_rate;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.optimizer.weight_decay = weight_decay;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_pos_weight_clamp(mut self, clamp: f32) -> Self {
        self.pos_weight_clamp = clamp;
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }
}

/// Losses and metrics of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub train_metrics: MetricsReport,
    pub val_metrics: MetricsReport,
}

/// Totally ordered checkpoint score, compared lexicographically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Score(pub Vec<f64>);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| format!("{:.4}", v)).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Maps epoch metrics to a checkpoint score.
pub trait CheckpointScorer {
    fn score(&self, metrics: &MetricsReport) -> Score;
}

impl<F> CheckpointScorer for F
where
    F: Fn(&MetricsReport) -> Score,
{
    fn score(&self, metrics: &MetricsReport) -> Score {
        self(metrics)
    }
}

/// Allergen recall first, then overall F1, then diet F1.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllergenRecallFirst;

impl CheckpointScorer for AllergenRecallFirst {
    fn score(&self, metrics: &MetricsReport) -> Score {
        Score(vec![metrics.allergens.recall, metrics.overall.f1, metrics.diets.f1])
    }
}

/// Remembers the best score seen and accepts only strict improvements.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSelector {
    best: Option<(usize, Score)>,
}

impl CheckpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `score` beats every earlier offer.
    pub fn offer(&mut self, epoch: usize, score: Score) -> bool {
        let improves = self.best.as_ref().map_or(true, |(_, best)| score > *best);
        if improves {
            self.best = Some((epoch, score));
        }
        improves
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|(epoch, _)| *epoch)
    }

    pub fn best_score(&self) -> Option<&Score> {
        self.best.as_ref().map(|(_, score)| score)
    }
}

/// Receives training output as it is produced.
pub trait CheckpointSink {
    /// Called for every epoch, after the checkpoint decision.
    fn on_epoch(&mut self, record: &EpochRecord) -> Result<(), ClassifierError>;

    /// Called when `artifact` becomes the best checkpoint so far.
    fn on_checkpoint(&mut self, artifact: &Artifact, record: &EpochRecord) -> Result<(), ClassifierError>;

    /// Called once after the last epoch with the winning record.
    fn finish(&mut self, _best: &EpochRecord) -> Result<(), ClassifierError> {
        Ok(())
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub history: Vec<EpochRecord>,
    pub checkpoints: Vec<usize>,
    pub latest: Option<Artifact>,
}

impl CheckpointSink for MemorySink {
    fn on_epoch(&mut self, record: &EpochRecord) -> Result<(), ClassifierError> {
        self.history.push(record.clone());
        Ok(())
    }

    fn on_checkpoint(&mut self, artifact: &Artifact, record: &EpochRecord) -> Result<(), ClassifierError> {
        self.checkpoints.push(record.epoch);
        self.latest = Some(artifact.clone());
        Ok(())
    }
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct TrainedRun {
    /// Artifact of the best-scoring epoch
    pub artifact: Artifact,
    pub best: EpochRecord,
    pub history: Vec<EpochRecord>,
    pub train_rows: usize,
    pub val_rows: usize,
}

/// Runs the epoch loop: train pass, validation pass, checkpoint decision.
pub struct Trainer {
    config: TrainConfig,
    runtime: RuntimeConfig,
    scorer: Box<dyn CheckpointScorer>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self {
            config,
            runtime: RuntimeConfig::default(),
            scorer: Box::new(AllergenRecallFirst),
        }
    }

    pub fn with_runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Replaces the checkpoint objective.
    pub fn with_scorer(mut self, scorer: impl CheckpointScorer + 'static) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Encodes both row sets on the runtime's worker pool.
    pub fn encode(
        &self,
        train_rows: &[Row],
        val_rows: &[Row],
        label_space: &LabelSpace,
    ) -> Result<(EncodedDataset, EncodedDataset), ClassifierError> {
        let pool = create_thread_pool(&self.runtime)?;
        let hasher = FeatureHasher::new(self.config.feature_dim);
        let train = EncodedDataset::encode(train_rows, label_space, &hasher, &pool);
        let val = EncodedDataset::encode(val_rows, label_space, &hasher, &pool);
        Ok((train, val))
    }

    /// Encodes rows and trains on them.
    pub fn fit_rows(
        &self,
        train_rows: &[Row],
        val_rows: &[Row],
        label_space: &LabelSpace,
        sink: &mut dyn CheckpointSink,
    ) -> Result<TrainedRun, ClassifierError> {
        let (train, val) = self.encode(train_rows, val_rows, label_space)?;
        info!("Train rows: {}", train.summary);
        info!("Validation rows: {}", val.summary);
        self.fit(&train, &val, sink)
    }

    /// Trains a fresh model.
    ///
    /// The validation set may be empty, in which case checkpoints are chosen
    /// on training metrics and validation metrics are reported as zero.
    ///
    /// # Errors
    /// - `EmptyDataset` if `train` has no samples
    /// - `ValidationError` for an empty label space, zero epochs, or datasets
    ///   encoded with different feature dimensions
    /// - `LabelSpaceMismatch` if the datasets disagree on the label space
    pub fn fit(
        &self,
        train: &EncodedDataset,
        val: &EncodedDataset,
        sink: &mut dyn CheckpointSink,
    ) -> Result<TrainedRun, ClassifierError> {
        let label_space = &train.label_space;
        if label_space.is_empty() {
            return Err(ClassifierError::ValidationError("Label space is empty; cannot train".into()));
        }
        if train.is_empty() {
            return Err(ClassifierError::EmptyDataset("no training rows after preprocessing".into()));
        }
        if self.config.epochs == 0 {
            return Err(ClassifierError::ValidationError("epochs must be at least 1".into()));
        }
        label_space.ensure_matches(&val.label_space)?;
        if train.feature_dim != val.feature_dim {
            return Err(ClassifierError::ValidationError(format!(
                "Train and validation feature_dim differ ({} vs {})",
                train.feature_dim, val.feature_dim
            )));
        }
        if val.is_empty() {
            warn!("No validation rows; checkpoints are selected on training metrics");
        }

        let config = &self.config;
        let batch_size = config.batch_size.max(1);
        let threshold = Threshold::global(config.threshold);
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut model = HashedMultilabelModel::new(
            train.feature_dim,
            label_space.output_dim(),
            config.model.clone(),
            self.runtime.device,
            config.seed,
        )?;
        let pos_weight = compute_pos_weight(train.target_matrix().view(), config.pos_weight_clamp);
        debug!("pos_weight = {:?}", pos_weight.to_vec());
        let criterion = WeightedBceLoss::new(pos_weight);
        let mut optimizer = AdamW::new(config.optimizer, model.weights());
        let mut grads = model.weights().zeros_like();

        info!(
            "Training {:?} model: {} train rows, {} val rows, {} labels, feature_dim {}, {} parameters",
            config.model.mode,
            train.len(),
            val.len(),
            label_space.output_dim(),
            train.feature_dim,
            model.weights().parameter_count()
        );

        let mut selector = CheckpointSelector::new();
        let mut history = Vec::with_capacity(config.epochs);
        let mut best: Option<(Artifact, EpochRecord)> = None;
        let mut order: Vec<usize> = (0..train.len()).collect();

        for epoch in 1..=config.epochs {
            order.shuffle(&mut rng);

            let mut losses = Vec::new();
            let mut logit_parts = Vec::new();
            let mut target_parts = Vec::new();
            for chunk in order.chunks(batch_size) {
                let batch = train.batch(chunk);
                let (logits, cache) = model.forward_train(&batch, &mut rng)?;
                let (loss, d_logits) = criterion.loss_and_grad(logits.view(), batch.targets.view())?;
                grads.fill(0.0);
                model.backward(&batch, &cache, d_logits.view(), &mut grads)?;
                optimizer.step(model.weights_mut(), &grads)?;

                losses.push(loss);
                logit_parts.push(logits);
                target_parts.push(batch.targets);
            }
            let train_loss = mean(&losses);
            let train_metrics = summarize(
                stack(&logit_parts, label_space.output_dim())?.view(),
                stack(&target_parts, label_space.output_dim())?.view(),
                label_space,
                &threshold,
            )?;

            let (val_loss, val_metrics) = if val.is_empty() {
                (0.0, MetricsReport::default())
            } else {
                let (loss, logits, targets) = evaluate_pass(&model, val, &criterion, batch_size)?;
                (loss, summarize(logits.view(), targets.view(), label_space, &threshold)?)
            };

            let record = EpochRecord {
                epoch,
                train_loss,
                val_loss,
                train_metrics,
                val_metrics,
            };

            let selection_metrics = if val.is_empty() {
                &record.train_metrics
            } else {
                &record.val_metrics
            };
            let score = self.scorer.score(selection_metrics);
            if selector.offer(epoch, score) {
                let artifact = Artifact::from_model(&model, label_space, threshold.clone(), epoch);
                sink.on_checkpoint(&artifact, &record)?;
                if let Some(score) = selector.best_score() {
                    debug!("epoch={:03} new best checkpoint score={}", epoch, score);
                }
                best = Some((artifact, record.clone()));
            }
            sink.on_epoch(&record)?;

            if epoch % config.log_every.max(1) == 0 {
                info!(
                    "epoch={:03} train_loss={:.4} val_loss={:.4} allergen_recall={:.3} overall_f1={:.3}",
                    epoch,
                    train_loss,
                    val_loss,
                    selection_metrics.allergens.recall,
                    selection_metrics.overall.f1
                );
            }
            history.push(record);
        }

        let (artifact, best) = best.ok_or_else(|| ClassifierError::ModelError("No checkpoint was recorded".into()))?;
        sink.finish(&best)?;
        info!(
            "Best epoch={} allergen_recall={:.3} overall_f1={:.3}",
            best.epoch,
            if val.is_empty() { best.train_metrics.allergens.recall } else { best.val_metrics.allergens.recall },
            if val.is_empty() { best.train_metrics.overall.f1 } else { best.val_metrics.overall.f1 }
        );

        Ok(TrainedRun {
            artifact,
            best,
            history,
            train_rows: train.len(),
            val_rows: val.len(),
        })
    }
}

/// Forward-only pass in storage order; returns the mean batch loss, logits
/// and targets.
pub(crate) fn evaluate_pass(
    model: &HashedMultilabelModel,
    dataset: &EncodedDataset,
    criterion: &WeightedBceLoss,
    batch_size: usize,
) -> Result<(f32, Array2<f32>, Array2<f32>), ClassifierError> {
    let mut losses = Vec::new();
    let mut logit_parts = Vec::new();
    let mut target_parts = Vec::new();
    for batch in dataset.batches(batch_size) {
        let logits = model.forward_batch(&batch)?;
        losses.push(criterion.loss(logits.view(), batch.targets.view())?);
        logit_parts.push(logits);
        target_parts.push(batch.targets);
    }
    let output_dim = dataset.output_dim();
    Ok((mean(&losses), stack(&logit_parts, output_dim)?, stack(&target_parts, output_dim)?))
}

pub(crate) fn stack(parts: &[Array2<f32>], output_dim: usize) -> Result<Array2<f32>, ClassifierError> {
    if parts.is_empty() {
        return Ok(Array2::zeros((0, output_dim)));
    }
    let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| ClassifierError::ModelError(format!("Failed to stack batches: {}", e)))
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}
