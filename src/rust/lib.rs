//! A hashed bag-of-features multi-label classifier for allergens and diets.
//!
//! Texts are hashed into a fixed feature space, pooled by an embedding bag and
//! scored by a linear (or small MLP) head. Training keeps the checkpoint with
//! the best allergen recall, thresholds can be tuned per label, and rows the
//! model is least sure about can be routed to an external teacher.
//!
//! # Basic Usage
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use allergen_classifier::{Classifier, LabelSpace, MemorySink, Row, TrainConfig, Trainer};
//!
//! let labels = LabelSpace::new(["peanut", "milk"], ["Vegan"])?;
//! let rows = vec![
//!     Row::new("1", "peanut butter cookies").with_allergens(vec!["peanut"]),
//!     Row::new("2", "whole milk latte").with_allergens(vec!["milk"]),
//!     Row::new("3", "roasted vegetables").with_diets(vec!["Vegan"]),
//! ];
//!
//! let trainer = Trainer::new(TrainConfig::default().with_feature_dim(1024).with_epochs(10));
//! let run = trainer.fit_rows(&rows, &[], &labels, &mut MemorySink::default())?;
//!
//! let classifier = Classifier::builder().with_artifact(run.artifact).build()?;
//! let prediction = classifier.predict("peanut butter")?;
//! println!("allergens: {:?}", prediction.allergens);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! A built classifier is immutable and can be shared across threads using `Arc`:
//!
//! ```rust,no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use allergen_classifier::{ArtifactRegistry, Classifier, FsArtifactRegistry};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let registry = FsArtifactRegistry::new_default()?;
//! let (_, artifact) = registry.load("latest")?;
//! let classifier = Arc::new(Classifier::builder().with_artifact(artifact).build()?);
//!
//! let mut handles = vec![];
//! for text in ["salted peanuts", "cheddar cheese", "green salad"] {
//!     let classifier = Arc::clone(&classifier);
//!     handles.push(thread::spawn(move || classifier.predict(text).map(|p| p.allergens)));
//! }
//!
//! for handle in handles {
//!     println!("{:?}", handle.join().unwrap()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod io;
pub mod registry;
mod runtime;

pub use classifier::{
    Artifact, Batch, CheckpointSink, Classifier, ClassifierBuilder, ClassifierError, ClassifierInfo, DistillConfig,
    EncodedDataset, EpochRecord, FeatureHasher, HashedMultilabelModel, LabelSpace, MemorySink, MetricsReport,
    ModelConfig, ModelMode, Row, Threshold, ThresholdTuner, TrainConfig, TrainedRun, Trainer, TunerConfig,
};
pub use io::{DataSummary, LoadSummary};
pub use registry::{ArtifactRegistry, FsArtifactRegistry, RegistryError, RunDir, RunSink};
pub use runtime::{create_thread_pool, Device, RuntimeConfig};

pub fn init_logger() {
    env_logger::init();
}
