use std::path::{Path, PathBuf};

use log::{error, info};

use super::artifact::Artifact;
use super::classifier::Classifier;
use super::error::ClassifierError;
use super::features::FeatureHasher;
use super::labels::LabelSpace;
use super::metrics::Threshold;
use crate::runtime::RuntimeConfig;

const DEFAULT_BATCH_SIZE: usize = 256;

/// A builder for constructing a Classifier with a fluent interface.
#[derive(Debug, Default)]
pub struct ClassifierBuilder {
    artifact: Option<Artifact>,
    artifact_path: Option<PathBuf>,
    threshold: Option<Threshold>,
    expected_labels: Option<LabelSpace>,
    batch_size: Option<usize>,
    runtime_config: RuntimeConfig,
}

impl ClassifierBuilder {
    /// Creates a new empty ClassifierBuilder instance with default configuration
    ///
    /// # Example
    /// ```
    /// use allergen_classifier::ClassifierBuilder;
    ///
    /// let builder = ClassifierBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the runtime configuration (compute device, encoding threads)
    ///
    /// # Arguments
    /// * `config` - The RuntimeConfig to use for encoding and inference
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    /// Uses an artifact already in memory
    ///
    /// # Arguments
    /// * `artifact` - A trained artifact, e.g. from [`crate::TrainedRun`]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Loads the artifact from a `model.json` file
    ///
    /// # Arguments
    /// * `path` - Path to the artifact file
    ///
    /// # Returns
    /// * `Result<Self, ClassifierError>` - The builder instance if successful, or an error if:
    ///   - An artifact has already been set
    ///   - The file does not exist
    ///   - The file is not a valid artifact
    pub fn with_artifact_file(mut self, path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        if self.artifact.is_some() {
            return Err(ClassifierError::BuildError("Artifact already set".to_string()));
        }
        let path = path.as_ref();
        let artifact = Artifact::load(path).map_err(|e| {
            error!("Failed to load artifact {}: {}", path.display(), e);
            e
        })?;
        info!("Artifact loaded from {}", path.display());
        self.artifact = Some(artifact);
        self.artifact_path = Some(path.to_path_buf());
        Ok(self)
    }

    /// Overrides the threshold stored in the artifact
    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Requires the artifact to use exactly this label space
    pub fn expect_label_space(mut self, label_space: LabelSpace) -> Self {
        self.expected_labels = Some(label_space);
        self
    }

    /// Batch size used when scoring datasets
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Builds the classifier
    ///
    /// # Returns
    /// * `Result<Classifier, ClassifierError>` - The built classifier if successful, or an error if:
    ///   - No artifact was provided
    ///   - The artifact's label space differs from the expected one
    ///   - The threshold vector does not match the label space
    ///   - The stored weights are inconsistent
    pub fn build(self) -> Result<Classifier, ClassifierError> {
        let artifact = self
            .artifact
            .ok_or_else(|| ClassifierError::BuildError("No artifact provided".to_string()))?;

        if let Some(expected) = &self.expected_labels {
            expected.ensure_matches(&artifact.label_space)?;
        }

        let threshold = self.threshold.unwrap_or_else(|| artifact.threshold.clone());
        threshold.resolve(artifact.output_dim())?;

        let model = artifact.to_model(self.runtime_config.device)?;
        info!(
            "Classifier ready: {} labels, feature_dim {}, epoch {}",
            artifact.output_dim(),
            artifact.feature_dim,
            artifact.epoch
        );

        Ok(Classifier {
            model,
            hasher: FeatureHasher::new(artifact.feature_dim),
            label_space: artifact.label_space,
            threshold,
            runtime: self.runtime_config,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            artifact_path: self.artifact_path,
            epoch: artifact.epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::model::{HashedMultilabelModel, ModelConfig};
    use crate::runtime::Device;

    fn artifact() -> Artifact {
        let space = LabelSpace::new(["milk", "egg"], ["Vegan"]).unwrap();
        let model = HashedMultilabelModel::new(32, 3, ModelConfig::default(), Device::Cpu, 1).unwrap();
        Artifact::from_model(&model, &space, Threshold::default(), 1)
    }

    #[test]
    fn test_build_requires_artifact() {
        let err = ClassifierBuilder::new().build().unwrap_err();
        assert!(matches!(err, ClassifierError::BuildError(_)));
    }

    #[test]
    fn test_threshold_override_is_checked() {
        let err = ClassifierBuilder::new()
            .with_artifact(artifact())
            .with_threshold(Threshold::PerLabel(vec![0.5, 0.5]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClassifierError::LabelSpaceMismatch { expected: 3, actual: 2 }));

        let classifier = ClassifierBuilder::new()
            .with_artifact(artifact())
            .with_threshold(Threshold::global(0.3))
            .build()
            .unwrap();
        assert_eq!(classifier.threshold(), &Threshold::Global(0.3));
    }

    #[test]
    fn test_expected_label_space() {
        let wrong = LabelSpace::new(["milk", "egg"], Vec::<String>::new()).unwrap();
        let err = ClassifierBuilder::new()
            .with_artifact(artifact())
            .expect_label_space(wrong)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClassifierError::LabelSpaceMismatch { .. }));
    }

    #[test]
    fn test_artifact_file_cannot_replace_artifact() {
        let result = ClassifierBuilder::new()
            .with_artifact(artifact())
            .with_artifact_file("model.json");
        assert!(matches!(result, Err(ClassifierError::BuildError(_))));
    }

    #[test]
    fn test_info_reflects_artifact() {
        let classifier = ClassifierBuilder::new().with_artifact(artifact()).build().unwrap();
        let info = classifier.info();
        assert_eq!(info.num_labels, 3);
        assert_eq!(info.feature_dim, 32);
        assert_eq!(info.allergen_labels, vec!["milk", "egg"]);
        assert!(info.artifact_path.is_none());
    }
}
