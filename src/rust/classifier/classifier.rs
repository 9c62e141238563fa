use std::collections::HashMap;
use std::path::PathBuf;

use ndarray::Array2;

use super::artifact::Artifact;
use super::dataset::{EncodeSummary, EncodedDataset, Row};
use super::error::ClassifierError;
use super::features::{FeatureHasher, TextFeatures};
use super::labels::{LabelKind, LabelSpace};
use super::metrics::{summarize, MetricsReport, Threshold};
use super::model::HashedMultilabelModel;
use super::trainer::stack;
use super::utils::{sigmoid, sigmoid_matrix};
use crate::runtime::{create_thread_pool, RuntimeConfig};

/// A trained allergen/diet classifier loaded from an [`Artifact`].
///
/// # Thread Safety
///
/// `Classifier` holds only owned, immutable data after construction and is
/// `Send + Sync`; share it across threads with `Arc`.
///
/// ```rust,no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use allergen_classifier::Classifier;
///
/// let classifier = Classifier::builder()
///     .with_artifact_file("artifacts/run-20250101-000000/model.json")?
///     .build()?;
///
/// let prediction = classifier.predict("peanut butter cookies")?;
/// println!("allergens: {:?}", prediction.allergens);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Classifier {
    pub(crate) model: HashedMultilabelModel,
    pub(crate) hasher: FeatureHasher,
    pub(crate) label_space: LabelSpace,
    pub(crate) threshold: Threshold,
    pub(crate) runtime: RuntimeConfig,
    pub(crate) batch_size: usize,
    pub(crate) artifact_path: Option<PathBuf>,
    pub(crate) epoch: usize,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<Classifier>();
    }
};

/// Labels that fire for one text.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub allergens: Vec<String>,
    pub diets: Vec<String>,
    /// Probability per label
    pub scores: HashMap<String, f32>,
}

/// Metrics of a classifier on a row set, with the encoding counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub summary: EncodeSummary,
    pub metrics: MetricsReport,
}

impl Classifier {
    /// Creates a new ClassifierBuilder for fluent construction
    pub fn builder() -> super::builder::ClassifierBuilder {
        super::builder::ClassifierBuilder::new()
    }

    /// Returns information about the classifier's current state
    pub fn info(&self) -> super::ClassifierInfo {
        super::ClassifierInfo {
            artifact_path: self.artifact_path.clone(),
            mode: self.model.config().mode,
            feature_dim: self.model.feature_dim(),
            num_labels: self.label_space.output_dim(),
            allergen_labels: self.label_space.allergens.clone(),
            diet_labels: self.label_space.diets.clone(),
            threshold: self.threshold.clone(),
            epoch: self.epoch,
            device: self.model.device(),
        }
    }

    pub fn label_space(&self) -> &LabelSpace {
        &self.label_space
    }

    pub fn threshold(&self) -> &Threshold {
        &self.threshold
    }

    pub fn model(&self) -> &HashedMultilabelModel {
        &self.model
    }

    /// Replaces the decision threshold.
    ///
    /// # Errors
    /// - `LabelSpaceMismatch` if a per-label vector has the wrong length
    pub fn set_threshold(&mut self, threshold: Threshold) -> Result<(), ClassifierError> {
        threshold.resolve(self.label_space.output_dim())?;
        self.threshold = threshold;
        Ok(())
    }

    /// Snapshot of the model and its current threshold.
    pub fn to_artifact(&self) -> Artifact {
        Artifact::from_model(&self.model, &self.label_space, self.threshold.clone(), self.epoch)
    }

    /// Encodes rows against this classifier's label space and feature size.
    pub fn encode(&self, rows: &[Row]) -> Result<EncodedDataset, ClassifierError> {
        let pool = create_thread_pool(&self.runtime)?;
        Ok(EncodedDataset::encode(rows, &self.label_space, &self.hasher, &pool))
    }

    /// Logits for every sample of `dataset`, in dataset order.
    ///
    /// # Errors
    /// - `LabelSpaceMismatch` if the dataset was encoded for another label space
    /// - `ValidationError` if it was hashed into another feature dimension
    pub fn logits(&self, dataset: &EncodedDataset) -> Result<Array2<f32>, ClassifierError> {
        self.label_space.ensure_matches(&dataset.label_space)?;
        if dataset.feature_dim != self.model.feature_dim() {
            return Err(ClassifierError::ValidationError(format!(
                "Dataset feature_dim {} does not match model feature_dim {}",
                dataset.feature_dim,
                self.model.feature_dim()
            )));
        }
        let parts = dataset
            .batches(self.batch_size)
            .map(|batch| self.model.forward_batch(&batch))
            .collect::<Result<Vec<_>, _>>()?;
        stack(&parts, self.label_space.output_dim())
    }

    pub fn probabilities(&self, dataset: &EncodedDataset) -> Result<Array2<f32>, ClassifierError> {
        Ok(sigmoid_matrix(self.logits(dataset)?.view()))
    }

    /// Metrics on an already encoded dataset at the current threshold.
    pub fn evaluate_dataset(&self, dataset: &EncodedDataset) -> Result<MetricsReport, ClassifierError> {
        let logits = self.logits(dataset)?;
        summarize(logits.view(), dataset.target_matrix().view(), &self.label_space, &self.threshold)
    }

    /// Encodes and scores `rows`. An empty row set yields all-zero metrics.
    pub fn evaluate(&self, rows: &[Row]) -> Result<Evaluation, ClassifierError> {
        let dataset = self.encode(rows)?;
        let metrics = self.evaluate_dataset(&dataset)?;
        Ok(Evaluation {
            summary: dataset.summary,
            metrics,
        })
    }

    /// Classifies a single text.
    pub fn predict(&self, text: &str) -> Result<Prediction, ClassifierError> {
        if text.trim().is_empty() {
            return Err(ClassifierError::ValidationError("Input text cannot be empty".into()));
        }
        let thresholds = self.threshold.resolve(self.label_space.output_dim())?;
        let features = self.hasher.extract(text);
        let logits = self.model.forward(&features, &[0])?;

        let mut prediction = Prediction {
            allergens: Vec::new(),
            diets: Vec::new(),
            scores: HashMap::new(),
        };
        for (index, label) in self.label_space.labels().enumerate() {
            let probability = sigmoid(logits[[0, index]]);
            prediction.scores.insert(label.to_string(), probability);
            if probability >= thresholds[index] {
                match self.label_space.kind_of(index) {
                    LabelKind::Allergen => prediction.allergens.push(label.to_string()),
                    LabelKind::Diet => prediction.diets.push(label.to_string()),
                }
            }
        }
        Ok(prediction)
    }
}
