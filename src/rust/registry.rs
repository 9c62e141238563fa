//! Run directories and the index that tracks trained artifacts.
//!
//! A run directory holds `model.json` (best epoch), `history.jsonl` (one
//! record per epoch) and `best_metrics.json`. Committing a run records the
//! SHA-256 of its `model.json` in `index.json` under the registry root, so a
//! later `load` can detect a modified artifact.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::{Artifact, CheckpointSink, ClassifierError, EpochRecord};
use crate::io::{append_jsonl, write_json};

/// Environment variable overriding the default registry root
pub const ARTIFACTS_ENV: &str = "ALLERGEN_ARTIFACTS";

pub const MODEL_FILE: &str = "model.json";
pub const HISTORY_FILE: &str = "history.jsonl";
pub const BEST_METRICS_FILE: &str = "best_metrics.json";
pub const INDEX_FILE: &str = "index.json";

/// Reference that [`ArtifactRegistry::resolve`] maps to the most recent run
pub const LATEST: &str = "latest";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// One committed run as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub location: PathBuf,
    pub sha256: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RegistryIndex {
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    runs: BTreeMap<String, RunEntry>,
}

/// A run directory, committed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    /// Id in the index; `None` for a directory given by path that was never committed
    pub run_id: Option<String>,
    pub path: PathBuf,
    /// Hash recorded at commit time
    pub sha256: Option<String>,
}

impl RunDir {
    pub fn model_path(&self) -> PathBuf {
        self.path.join(MODEL_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.path.join(HISTORY_FILE)
    }

    pub fn best_metrics_path(&self) -> PathBuf {
        self.path.join(BEST_METRICS_FILE)
    }

    /// Path of another file inside the run directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// A checkpoint sink writing into this directory.
    pub fn sink(&self) -> RunSink {
        RunSink::new(self.path.clone())
    }
}

/// Storage for trained artifacts.
pub trait ArtifactRegistry {
    /// Creates an empty run directory with a fresh id.
    fn create_run(&self) -> Result<RunDir, RegistryError>;

    /// Records the run's current `model.json` hash and marks it latest.
    fn commit(&self, run: &RunDir) -> Result<RunEntry, RegistryError>;

    /// Maps `latest`, a run id, or a directory/`model.json` path to a run.
    fn resolve(&self, reference: &str) -> Result<RunDir, RegistryError>;

    /// Id of the most recently committed run.
    fn latest(&self) -> Result<Option<String>, RegistryError>;

    /// Loads the artifact of a run, checking its recorded hash.
    fn load(&self, reference: &str) -> Result<(RunDir, Artifact), RegistryError>;

    /// True when the run's `model.json` still matches the recorded hash.
    fn verify(&self, reference: &str) -> Result<bool, RegistryError>;
}

/// Registry backed by a directory of run directories and an `index.json`.
#[derive(Debug, Clone)]
pub struct FsArtifactRegistry {
    root: PathBuf,
}

impl FsArtifactRegistry {
    /// Opens the registry at the default root
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::default_root())
    }

    /// Returns the default registry root
    pub fn default_root() -> PathBuf {
        if let Ok(path) = env::var(ARTIFACTS_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(data_dir) = dirs::data_dir() {
            return data_dir.join("allergen-classifier").join("artifacts");
        }

        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".allergen-classifier").join("artifacts");
        }

        env::temp_dir().join("allergen-classifier").join("artifacts")
    }

    /// Opens the registry at `root`, or the default root when `None`.
    pub fn open(root: Option<PathBuf>) -> io::Result<Self> {
        match root {
            Some(root) => Self::new(root),
            None => Self::new_default(),
        }
    }

    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All committed run ids, oldest first.
    pub fn runs(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.read_index()?.runs.into_keys().collect())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<RegistryIndex, RegistryError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(RegistryIndex::default());
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_index(&self, index: &RegistryIndex) -> Result<(), RegistryError> {
        let path = self.index_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn run_from_entry(run_id: &str, entry: &RunEntry) -> RunDir {
        RunDir {
            run_id: Some(run_id.to_string()),
            path: entry.location.clone(),
            sha256: Some(entry.sha256.clone()),
        }
    }
}

impl ArtifactRegistry for FsArtifactRegistry {
    fn create_run(&self) -> Result<RunDir, RegistryError> {
        let base = Utc::now().format("run-%Y%m%d-%H%M%S").to_string();
        let mut run_id = base.clone();
        let mut suffix = 1;
        while self.root.join(&run_id).exists() {
            suffix += 1;
            run_id = format!("{}-{}", base, suffix);
        }
        let path = self.root.join(&run_id);
        fs::create_dir_all(&path)?;
        info!("Created run directory {}", path.display());
        Ok(RunDir {
            run_id: Some(run_id),
            path,
            sha256: None,
        })
    }

    fn commit(&self, run: &RunDir) -> Result<RunEntry, RegistryError> {
        let run_id = match &run.run_id {
            Some(run_id) => run_id.clone(),
            None => run
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| RegistryError::NotFound(run.path.display().to_string()))?,
        };
        let model_path = run.model_path();
        if !model_path.exists() {
            return Err(RegistryError::NotFound(model_path.display().to_string()));
        }

        let entry = RunEntry {
            location: run.path.clone(),
            sha256: hash_file(&model_path)?,
            committed_at: Utc::now(),
        };
        let mut index = self.read_index()?;
        index.runs.insert(run_id.clone(), entry.clone());
        index.latest = Some(run_id.clone());
        self.write_index(&index)?;
        info!("Committed {} (sha256 {})", run_id, entry.sha256);
        Ok(entry)
    }

    fn resolve(&self, reference: &str) -> Result<RunDir, RegistryError> {
        let reference = reference.trim();
        let index = self.read_index()?;

        if reference.is_empty() || reference == LATEST {
            let run_id = index
                .latest
                .as_deref()
                .ok_or_else(|| RegistryError::NotFound("no committed runs".to_string()))?;
            let entry = index
                .runs
                .get(run_id)
                .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))?;
            return Ok(Self::run_from_entry(run_id, entry));
        }

        if let Some(entry) = index.runs.get(reference) {
            return Ok(Self::run_from_entry(reference, entry));
        }

        // run directories resolve under the root before the working directory
        let under_root = self.root.join(reference);
        let mut path = if under_root.exists() {
            under_root
        } else {
            PathBuf::from(reference)
        };
        if path.is_file() {
            path = match path.parent() {
                Some(parent) => parent.to_path_buf(),
                None => PathBuf::from("."),
            };
        }
        if !path.join(MODEL_FILE).exists() {
            return Err(RegistryError::NotFound(reference.to_string()));
        }

        // a path that was committed keeps its recorded hash
        let known = index.runs.iter().find(|(_, entry)| same_path(&entry.location, &path));
        Ok(match known {
            Some((run_id, entry)) => Self::run_from_entry(run_id, entry),
            None => RunDir {
                run_id: None,
                path,
                sha256: None,
            },
        })
    }

    fn latest(&self) -> Result<Option<String>, RegistryError> {
        Ok(self.read_index()?.latest)
    }

    fn load(&self, reference: &str) -> Result<(RunDir, Artifact), RegistryError> {
        let run = self.resolve(reference)?;
        let model_path = run.model_path();
        let bytes = fs::read(&model_path)?;
        match &run.sha256 {
            Some(expected) => {
                let actual = hash_bytes(&bytes);
                if &actual != expected {
                    warn!("{} does not match its recorded hash", model_path.display());
                    return Err(RegistryError::HashMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            None => warn!("{} is not in the registry; loading without verification", model_path.display()),
        }
        let artifact = serde_json::from_slice(&bytes)?;
        debug!("Loaded artifact from {}", model_path.display());
        Ok((run, artifact))
    }

    fn verify(&self, reference: &str) -> Result<bool, RegistryError> {
        let run = self.resolve(reference)?;
        let Some(expected) = &run.sha256 else {
            return Ok(false);
        };
        let model_path = run.model_path();
        if !model_path.exists() {
            return Ok(false);
        }
        let actual = hash_file(&model_path)?;
        debug!("Verifying {}: expected {}, got {}", model_path.display(), expected, actual);
        Ok(&actual == expected)
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn hash_file(path: &Path) -> Result<String, RegistryError> {
    Ok(hash_bytes(&fs::read(path)?))
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Checkpoint sink that persists a training run into a run directory.
///
/// `model.json` is rewritten on every new best epoch, each epoch is appended
/// to `history.jsonl`, and `best_metrics.json` is written when training ends.
#[derive(Debug)]
pub struct RunSink {
    dir: PathBuf,
    history_started: bool,
}

impl RunSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            history_started: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointSink for RunSink {
    fn on_epoch(&mut self, record: &EpochRecord) -> Result<(), ClassifierError> {
        let path = self.dir.join(HISTORY_FILE);
        if !self.history_started {
            // a reused directory starts a fresh history
            if path.exists() {
                fs::remove_file(&path)?;
            }
            self.history_started = true;
        }
        append_jsonl(path, record)
    }

    fn on_checkpoint(&mut self, artifact: &Artifact, record: &EpochRecord) -> Result<(), ClassifierError> {
        let path = self.dir.join(MODEL_FILE);
        artifact.save(&path)?;
        debug!("Checkpoint epoch={:03} saved to {}", record.epoch, path.display());
        Ok(())
    }

    fn finish(&mut self, best: &EpochRecord) -> Result<(), ClassifierError> {
        write_json(self.dir.join(BEST_METRICS_FILE), best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{HashedMultilabelModel, LabelSpace, MetricsReport, ModelConfig, Threshold};
    use crate::runtime::Device;
    use tempfile::tempdir;

    fn artifact(epoch: usize) -> Artifact {
        let space = LabelSpace::new(["milk"], ["Vegan"]).unwrap();
        let model = HashedMultilabelModel::new(16, 2, ModelConfig::default(), Device::Cpu, 5).unwrap();
        Artifact::from_model(&model, &space, Threshold::default(), epoch)
    }

    fn record(epoch: usize) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 0.5,
            val_loss: 0.6,
            train_metrics: MetricsReport::default(),
            val_metrics: MetricsReport::default(),
        }
    }

    #[test]
    fn test_commit_and_load_latest() {
        let dir = tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path()).unwrap();
        assert_eq!(registry.latest().unwrap(), None);

        let run = registry.create_run().unwrap();
        artifact(3).save(run.model_path()).unwrap();
        registry.commit(&run).unwrap();

        assert_eq!(registry.latest().unwrap(), run.run_id);
        let (resolved, loaded) = registry.load(LATEST).unwrap();
        assert_eq!(resolved.path, run.path);
        assert_eq!(loaded.epoch, 3);
        assert!(registry.verify(LATEST).unwrap());
    }

    #[test]
    fn test_tampered_model_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path()).unwrap();
        let run = registry.create_run().unwrap();
        artifact(1).save(run.model_path()).unwrap();
        registry.commit(&run).unwrap();

        artifact(2).save(run.model_path()).unwrap();
        let run_id = run.run_id.clone().unwrap();
        assert!(!registry.verify(&run_id).unwrap());
        assert!(matches!(registry.load(&run_id), Err(RegistryError::HashMismatch { .. })));
    }

    #[test]
    fn test_resolve_by_path_and_unknown() {
        let dir = tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path().join("registry")).unwrap();
        let loose = dir.path().join("loose");
        artifact(4).save(loose.join(MODEL_FILE)).unwrap();

        let run = registry.resolve(loose.join(MODEL_FILE).to_str().unwrap()).unwrap();
        assert_eq!(run.run_id, None);
        assert_eq!(run.path, loose);
        assert_eq!(registry.load(loose.to_str().unwrap()).unwrap().1.epoch, 4);

        assert!(matches!(registry.resolve("run-missing"), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.resolve(LATEST), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_uncommitted_run_resolves_under_root() {
        let dir = tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path()).unwrap();
        let run = registry.create_run().unwrap();
        artifact(6).save(run.model_path()).unwrap();

        let run_id = run.run_id.clone().unwrap();
        let resolved = registry.resolve(&run_id).unwrap();
        assert_eq!(resolved.run_id, None);
        assert_eq!(resolved.path, run.path);
        assert_eq!(registry.load(&run_id).unwrap().1.epoch, 6);
    }

    #[test]
    fn test_create_run_ids_are_unique() {
        let dir = tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path()).unwrap();
        let first = registry.create_run().unwrap();
        let second = registry.create_run().unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert!(first.run_id.unwrap().starts_with("run-"));
    }

    #[test]
    fn test_run_sink_writes_run_files() {
        let dir = tempdir().unwrap();
        let run = RunDir {
            run_id: None,
            path: dir.path().to_path_buf(),
            sha256: None,
        };
        let mut sink = run.sink();
        sink.on_epoch(&record(1)).unwrap();
        sink.on_checkpoint(&artifact(1), &record(1)).unwrap();
        sink.on_epoch(&record(2)).unwrap();
        sink.finish(&record(1)).unwrap();

        let history = fs::read_to_string(run.history_path()).unwrap();
        assert_eq!(history.lines().count(), 2);
        assert!(run.model_path().exists());
        let best: EpochRecord = serde_json::from_slice(&fs::read(run.best_metrics_path()).unwrap()).unwrap();
        assert_eq!(best.epoch, 1);
    }
}
