use std::path::PathBuf;

mod error;
mod utils;
pub mod artifact;
pub mod builder;
#[allow(clippy::module_inception)]
pub mod classifier;
pub mod dataset;
pub mod distill;
pub mod features;
pub mod labels;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;
pub mod tuning;

pub use artifact::Artifact;
pub use builder::ClassifierBuilder;
pub use classifier::{Classifier, Evaluation, Prediction};
pub use dataset::{collate, Batch, EncodeSummary, EncodedDataset, Row, Sample};
pub use distill::{
    accept_teacher_labels, build_candidates, score_student, select_candidates, Candidate, DistillConfig,
    IntakeSummary, Selection, TeacherLabel,
};
pub use error::ClassifierError;
pub use features::{hash_feature, FeatureHasher, TextFeatures, SENTINEL_FEATURE};
pub use labels::{LabelKind, LabelSpace, CANONICAL_ALLERGENS};
pub use loss::{compute_pos_weight, WeightedBceLoss};
pub use metrics::{summarize, HeadMetrics, LabelMetrics, MetricsReport, Threshold};
pub use model::{BagMode, HashedMultilabelModel, ModelConfig, ModelMode, Weights};
pub use optim::{AdamW, AdamWConfig};
pub use trainer::{
    AllergenRecallFirst, CheckpointScorer, CheckpointSelector, CheckpointSink, EpochRecord, MemorySink, Score,
    TrainConfig, TrainedRun, Trainer,
};
pub use tuning::{threshold_grid, PerLabelTuning, ThresholdTuner, TunerConfig, TuningReport};

use crate::runtime::Device;

/// Information about the current state and configuration of a classifier
#[derive(Debug, Clone)]
pub struct ClassifierInfo {
    /// File the artifact was loaded from, if any
    pub artifact_path: Option<PathBuf>,
    pub mode: ModelMode,
    /// Size of the hashed feature space
    pub feature_dim: usize,
    /// Number of output labels (allergens + diets)
    pub num_labels: usize,
    pub allergen_labels: Vec<String>,
    pub diet_labels: Vec<String>,
    pub threshold: Threshold,
    /// Training epoch the weights come from
    pub epoch: usize,
    pub device: Device,
}
