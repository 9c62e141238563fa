use std::collections::BTreeSet;
use std::fmt;

use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::error::ClassifierError;
use super::features::{FeatureHasher, TextFeatures, SENTINEL_FEATURE};
use super::labels::LabelSpace;
use crate::runtime::{create_thread_pool, RuntimeConfig};

/// One input record. Only `id`, `text`, `allergens` and `diets` are read;
/// `source` and `meta` pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allergens: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub diets: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Row {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_allergens(mut self, allergens: Vec<impl Into<String>>) -> Self {
        self.allergens = allergens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_diets(mut self, diets: Vec<impl Into<String>>) -> Self {
        self.diets = diets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Trims id and text, trims/deduplicates/sorts label sets.
    pub fn normalized(mut self) -> Self {
        fn clean(values: Vec<String>) -> Vec<String> {
            values
                .into_iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }
        self.id = self.id.trim().to_string();
        self.text = self.text.trim().to_string();
        self.allergens = clean(self.allergens);
        self.diets = clean(self.diets);
        self
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Encoded form of one row: sorted unique feature indices plus the
/// multi-hot target in label-space order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<u32>,
    pub target: Vec<f32>,
}

/// Counters describing what encoding kept and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeSummary {
    pub rows: usize,
    pub kept: usize,
    pub skipped_empty_text: usize,
    /// Label mentions outside the canonical label space
    pub dropped_labels: usize,
}

impl fmt::Display for EncodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows={} kept={} skipped_empty_text={} dropped_labels={}",
            self.rows, self.kept, self.skipped_empty_text, self.dropped_labels
        )
    }
}

/// Rows encoded once against a fixed label space and feature dimension.
///
/// `source_rows[i]` is the position in the input slice that produced
/// `samples[i]`; the input order is preserved.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    pub label_space: LabelSpace,
    pub feature_dim: usize,
    pub samples: Vec<Sample>,
    pub source_rows: Vec<usize>,
    pub summary: EncodeSummary,
}

impl EncodedDataset {
    /// Encodes `rows` on the given pool. Rows with empty text are skipped and
    /// counted; unknown labels are dropped and counted.
    pub fn encode<H>(rows: &[Row], label_space: &LabelSpace, hasher: &H, pool: &ThreadPool) -> Self
    where
        H: TextFeatures + Sync,
    {
        let allergen_index = label_space.allergen_index();
        let diet_index = label_space.diet_index();
        let output_dim = label_space.output_dim();

        // indexed parallel collect keeps input order
        let encoded: Vec<Option<(Sample, usize)>> = pool.install(|| {
            rows.par_iter()
                .map(|row| {
                    let text = row.text.trim();
                    if text.is_empty() {
                        return None;
                    }
                    let mut target = vec![0.0f32; output_dim];
                    let mut dropped = 0usize;
                    let labels = row
                        .allergens
                        .iter()
                        .map(|label| (&allergen_index, label))
                        .chain(row.diets.iter().map(|label| (&diet_index, label)));
                    for (index, label) in labels {
                        let label = label.trim();
                        if label.is_empty() {
                            continue;
                        }
                        match index.get(label) {
                            Some(&position) => target[position] = 1.0,
                            None => dropped += 1,
                        }
                    }
                    let features = hasher.extract(text);
                    Some((Sample { features, target }, dropped))
                })
                .collect()
        });

        let mut summary = EncodeSummary {
            rows: rows.len(),
            ..EncodeSummary::default()
        };
        let mut samples = Vec::with_capacity(rows.len());
        let mut source_rows = Vec::with_capacity(rows.len());
        for (position, item) in encoded.into_iter().enumerate() {
            match item {
                Some((sample, dropped)) => {
                    summary.dropped_labels += dropped;
                    samples.push(sample);
                    source_rows.push(position);
                }
                None => {
                    debug!("Skipping row '{}' with empty text", rows[position].id);
                    summary.skipped_empty_text += 1;
                }
            }
        }
        summary.kept = samples.len();

        Self {
            label_space: label_space.clone(),
            feature_dim: hasher.feature_dim(),
            samples,
            source_rows,
            summary,
        }
    }

    /// Encodes with a fresh [`FeatureHasher`] and a pool built from `runtime`.
    pub fn from_rows(
        rows: &[Row],
        label_space: &LabelSpace,
        feature_dim: usize,
        runtime: &RuntimeConfig,
    ) -> Result<Self, ClassifierError> {
        let pool = create_thread_pool(runtime)?;
        let hasher = FeatureHasher::new(feature_dim);
        Ok(Self::encode(rows, label_space, &hasher, &pool))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn output_dim(&self) -> usize {
        self.label_space.output_dim()
    }

    /// All targets stacked as `(len, output_dim)`.
    pub fn target_matrix(&self) -> Array2<f32> {
        let output_dim = self.output_dim();
        Array2::from_shape_fn((self.samples.len(), output_dim), |(i, j)| self.samples[i].target[j])
    }

    /// Collates the samples at `indices`, in that order.
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let picked: Vec<&Sample> = indices.iter().map(|&index| &self.samples[index]).collect();
        collate(&picked, self.output_dim())
    }

    /// Sequential batches over the dataset in storage order.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let order: Vec<usize> = (0..self.samples.len()).collect();
        let size = batch_size.max(1);
        let chunks: Vec<Vec<usize>> = order.chunks(size).map(<[usize]>::to_vec).collect();
        chunks.into_iter().map(move |chunk| self.batch(&chunk))
    }
}

/// Padding-free batch: all feature indices concatenated, `offsets[i]` marks
/// where sample `i` starts in `features`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Vec<u32>,
    pub offsets: Vec<usize>,
    pub targets: Array2<f32>,
}

impl Batch {
    /// Number of real samples (the empty placeholder counts zero).
    pub fn len(&self) -> usize {
        self.targets.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flattens samples into the sum-pooling input layout.
///
/// An empty batch collates to a single placeholder sample holding the
/// sentinel feature so pooling stays well defined; its target matrix has
/// zero rows.
pub fn collate(samples: &[&Sample], output_dim: usize) -> Batch {
    let mut features = Vec::with_capacity(samples.iter().map(|s| s.features.len()).sum());
    let mut offsets = Vec::with_capacity(samples.len());

    for sample in samples {
        offsets.push(features.len());
        features.extend_from_slice(&sample.features);
    }

    if features.is_empty() {
        features = vec![SENTINEL_FEATURE];
        offsets = vec![0];
    }

    let targets = Array2::from_shape_fn((samples.len(), output_dim), |(i, j)| samples[i].target[j]);

    Batch {
        features,
        offsets,
        targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> LabelSpace {
        LabelSpace::new(["milk", "peanut"], ["Vegan"]).unwrap()
    }

    fn encode(rows: &[Row]) -> EncodedDataset {
        EncodedDataset::from_rows(rows, &space(), 1024, &RuntimeConfig::default().with_encode_threads(2))
            .unwrap()
    }

    #[test]
    fn test_encode_builds_multi_hot_targets() {
        let rows = vec![
            Row::new("a", "Peanut butter").with_allergens(vec!["peanut"]),
            Row::new("b", "oat drink").with_diets(vec!["Vegan"]),
        ];
        let dataset = encode(&rows);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.samples[0].target, vec![0.0, 1.0, 0.0]);
        assert_eq!(dataset.samples[1].target, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_encode_skips_empty_text_and_counts_unknown_labels() {
        let rows = vec![
            Row::new("a", "   ").with_allergens(vec!["milk"]),
            Row::new("b", "whole milk").with_allergens(vec!["milk", "lupin"]),
        ];
        let dataset = encode(&rows);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.source_rows, vec![1]);
        assert_eq!(dataset.summary.skipped_empty_text, 1);
        assert_eq!(dataset.summary.dropped_labels, 1);
        assert_eq!(dataset.summary.kept, 1);
    }

    #[test]
    fn test_encode_ignores_blank_labels() {
        let rows = vec![Row::new("a", "soy milk")
            .with_allergens(vec!["milk", "", "  "])
            .with_diets(vec![" ", "Vegan"])];
        let dataset = encode(&rows);
        assert_eq!(dataset.summary.dropped_labels, 0);
        assert_eq!(dataset.samples[0].target, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_encode_preserves_input_order() {
        let rows: Vec<Row> = (0..200)
            .map(|i| Row::new(i.to_string(), format!("ingredient number {i}")))
            .collect();
        let dataset = encode(&rows);
        let hasher = FeatureHasher::new(1024);
        for (position, sample) in dataset.samples.iter().enumerate() {
            assert_eq!(dataset.source_rows[position], position);
            assert_eq!(sample.features, hasher.extract(&rows[position].text));
        }
    }

    #[test]
    fn test_collate_offsets_mark_sample_starts() {
        let a = Sample { features: vec![1, 4, 9], target: vec![1.0, 0.0] };
        let b = Sample { features: vec![2], target: vec![0.0, 1.0] };
        let batch = collate(&[&a, &b], 2);
        assert_eq!(batch.features, vec![1, 4, 9, 2]);
        assert_eq!(batch.offsets, vec![0, 3]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.targets[[1, 1]], 1.0);
    }

    #[test]
    fn test_collate_empty_batch_uses_placeholder() {
        let batch = collate(&[], 3);
        assert_eq!(batch.features, vec![SENTINEL_FEATURE]);
        assert_eq!(batch.offsets, vec![0]);
        assert!(batch.is_empty());
        assert_eq!(batch.targets.dim(), (0, 3));
    }

    #[test]
    fn test_row_deserializes_nulls_and_keeps_meta() {
        let row: Row = serde_json::from_str(
            r#"{"id":"x","text":"egg noodles","allergens":null,"meta":{"fdc_id":12}}"#,
        )
        .unwrap();
        assert!(row.allergens.is_empty());
        assert_eq!(row.meta["fdc_id"], 12);
    }

    #[test]
    fn test_row_normalized_sorts_and_dedups() {
        let row = Row::new(" id ", " text ")
            .with_allergens(vec!["soy", " milk", "soy", ""])
            .normalized();
        assert_eq!(row.id, "id");
        assert_eq!(row.text, "text");
        assert_eq!(row.allergens, vec!["milk", "soy"]);
    }
}
