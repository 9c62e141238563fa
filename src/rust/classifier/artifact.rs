use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::labels::LabelSpace;
use super::metrics::Threshold;
use super::model::{HashedMultilabelModel, ModelConfig, Weights};
use crate::runtime::Device;

/// Everything needed to rebuild a trained model and decode its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub feature_dim: usize,
    pub label_space: LabelSpace,
    pub model: ModelConfig,
    pub threshold: Threshold,
    /// Epoch the weights were taken from, 1-based
    pub epoch: usize,
    pub created_at: DateTime<Utc>,
    pub weights: Weights,
}

impl Artifact {
    /// Snapshots `model` together with its decoding context.
    pub fn from_model(
        model: &HashedMultilabelModel,
        label_space: &LabelSpace,
        threshold: Threshold,
        epoch: usize,
    ) -> Self {
        Self {
            feature_dim: model.feature_dim(),
            label_space: label_space.clone(),
            model: model.config().clone(),
            threshold,
            epoch,
            created_at: Utc::now(),
            weights: model.weights().clone(),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.label_space.output_dim()
    }

    /// Rebuilds the model on `device`.
    ///
    /// # Errors
    /// - `ModelError` if the stored weights disagree with the stored shapes
    /// - `LabelSpaceMismatch` if a per-label threshold has the wrong length
    pub fn to_model(&self, device: Device) -> Result<HashedMultilabelModel, ClassifierError> {
        self.threshold.resolve(self.output_dim())?;
        HashedMultilabelModel::from_weights(
            self.feature_dim,
            self.output_dim(),
            self.model.clone(),
            device,
            self.weights.clone(),
        )
    }

    /// Writes the artifact as JSON, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::InputMissing(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_reload_model() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let space = LabelSpace::new(["milk"], ["Vegan"])?;
        let model = HashedMultilabelModel::new(16, 2, ModelConfig::mlp().with_embed_dim(4).with_hidden_dim(3), Device::Cpu, 2)?;
        let artifact = Artifact::from_model(&model, &space, Threshold::PerLabel(vec![0.3, 0.7]), 4);

        let path = dir.path().join("run").join("model.json");
        artifact.save(&path)?;
        let loaded = Artifact::load(&path)?;
        assert_eq!(loaded, artifact);

        let rebuilt = loaded.to_model(Device::Cpu)?;
        let features = [1u32, 5, 9];
        assert_eq!(rebuilt.forward(&features, &[0])?, model.forward(&features, &[0])?);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = Artifact::load("/nonexistent/model.json").unwrap_err();
        assert!(matches!(err, ClassifierError::InputMissing(_)));
    }

    #[test]
    fn test_threshold_length_is_checked() {
        let space = LabelSpace::new(["milk"], ["Vegan"]).unwrap();
        let model = HashedMultilabelModel::new(8, 2, ModelConfig::default(), Device::Cpu, 1).unwrap();
        let artifact = Artifact::from_model(&model, &space, Threshold::PerLabel(vec![0.5]), 1);
        assert!(matches!(
            artifact.to_model(Device::Cpu),
            Err(ClassifierError::LabelSpaceMismatch { expected: 2, actual: 1 })
        ));
    }
}
