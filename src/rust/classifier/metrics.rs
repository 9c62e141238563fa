use std::ops::Range;

use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::labels::{LabelKind, LabelSpace};
use super::utils::{f1, safe_div, sigmoid};

/// Decision threshold: one value for every label, or one per label in
/// label-space order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Global(f32),
    PerLabel(Vec<f32>),
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::Global(0.5)
    }
}

impl Threshold {
    /// Global threshold clamped to `[0, 1]`.
    pub fn global(value: f32) -> Self {
        Threshold::Global(value.clamp(0.0, 1.0))
    }

    /// Expands to one threshold per label.
    ///
    /// # Errors
    /// - `LabelSpaceMismatch` if a per-label vector has the wrong length
    pub fn resolve(&self, output_dim: usize) -> Result<Vec<f32>, ClassifierError> {
        match self {
            Threshold::Global(value) => Ok(vec![*value; output_dim]),
            Threshold::PerLabel(values) if values.len() == output_dim => Ok(values.clone()),
            Threshold::PerLabel(values) => Err(ClassifierError::LabelSpaceMismatch {
                expected: output_dim,
                actual: values.len(),
            }),
        }
    }
}

/// Micro-averaged scores over one partition of the label space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    #[serde(rename = "tp")]
    pub true_positives: u64,
    #[serde(rename = "fp")]
    pub false_positives: u64,
    #[serde(rename = "fn")]
    pub false_negatives: u64,
    pub support: u64,
}

impl HeadMetrics {
    fn from_counts(tp: u64, fp: u64, fn_: u64) -> Self {
        let precision = safe_div(tp as f64, (tp + fp) as f64);
        let recall = safe_div(tp as f64, (tp + fn_) as f64);
        Self {
            precision,
            recall,
            f1: f1(precision, recall),
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            support: tp + fn_,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMetrics {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: LabelKind,
    #[serde(flatten)]
    pub scores: HeadMetrics,
}

/// Result of thresholding a logit matrix against its targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub overall: HeadMetrics,
    pub allergens: HeadMetrics,
    pub diets: HeadMetrics,
    pub per_label: Vec<LabelMetrics>,
    pub allergen_false_negatives: u64,
}

/// Per-label confusion counts; true negatives are not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Confusion {
    pub tp: u64,
    pub fp: u64,
    pub fn_: u64,
}

impl Confusion {
    /// Counts for column `label` at `threshold`, over probabilities.
    pub(crate) fn for_label(probabilities: ArrayView2<f32>, targets: ArrayView2<f32>, label: usize, threshold: f32) -> Self {
        let mut counts = Confusion::default();
        for (&p, &y) in probabilities.column(label).iter().zip(targets.column(label).iter()) {
            match (p >= threshold, y >= 0.5) {
                (true, true) => counts.tp += 1,
                (true, false) => counts.fp += 1,
                (false, true) => counts.fn_ += 1,
                (false, false) => {}
            }
        }
        counts
    }
}

fn aggregate(counts: &[Confusion], range: Range<usize>) -> HeadMetrics {
    let (tp, fp, fn_) = counts[range]
        .iter()
        .fold((0, 0, 0), |(tp, fp, fn_), c| (tp + c.tp, fp + c.fp, fn_ + c.fn_));
    HeadMetrics::from_counts(tp, fp, fn_)
}

/// Computes metrics for `logits` against multi-hot `targets`.
///
/// A label fires when `sigmoid(logit) >= threshold[label]`. Aggregates are
/// micro-averaged within the allergen, diet and overall partitions. A target
/// matrix with no rows yields the all-zero report.
///
/// # Errors
/// - `LabelSpaceMismatch` if the threshold vector or the matrix widths do not
///   match the label space
pub fn summarize(
    logits: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    label_space: &LabelSpace,
    threshold: &Threshold,
) -> Result<MetricsReport, ClassifierError> {
    let output_dim = label_space.output_dim();
    let thresholds = threshold.resolve(output_dim)?;

    if targets.nrows() == 0 || output_dim == 0 {
        return Ok(MetricsReport::default());
    }
    for width in [logits.ncols(), targets.ncols()] {
        if width != output_dim {
            return Err(ClassifierError::LabelSpaceMismatch {
                expected: output_dim,
                actual: width,
            });
        }
    }
    if logits.nrows() != targets.nrows() {
        return Err(ClassifierError::ValidationError(format!(
            "{} logit rows for {} target rows",
            logits.nrows(),
            targets.nrows()
        )));
    }

    let probabilities = logits.mapv(sigmoid);
    let counts: Vec<Confusion> = (0..output_dim)
        .map(|label| Confusion::for_label(probabilities.view(), targets, label, thresholds[label]))
        .collect();

    let per_label = label_space
        .labels()
        .enumerate()
        .map(|(index, label)| LabelMetrics {
            label: label.to_string(),
            kind: label_space.kind_of(index),
            scores: aggregate(&counts, index..index + 1),
        })
        .collect();

    let allergens = aggregate(&counts, label_space.allergen_range());
    Ok(MetricsReport {
        overall: aggregate(&counts, 0..output_dim),
        allergens,
        diets: aggregate(&counts, label_space.diet_range()),
        per_label,
        allergen_false_negatives: allergens.false_negatives,
    })
}

/// Column-wise positive counts of a target matrix.
pub(crate) fn label_support(targets: ArrayView2<f32>) -> Vec<u64> {
    targets
        .map_axis(Axis(0), |column| column.iter().filter(|&&y| y >= 0.5).count() as u64)
        .to_vec()
}
