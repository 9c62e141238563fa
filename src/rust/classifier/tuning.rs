use log::debug;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::labels::{LabelKind, LabelSpace};
use super::metrics::{label_support, summarize, Confusion, MetricsReport, Threshold};
use super::utils::{clamp01, safe_div, sigmoid_matrix};

const PINNED_NOTE: &str = "No positives in validation; threshold pinned to 1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub min_threshold: f32,
    pub max_threshold: f32,
    pub steps: usize,
    pub allergen_recall_target: f64,
    pub diet_recall_target: f64,
    /// Lower bound on the grid size of the per-label search
    pub per_label_min_steps: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.05,
            max_threshold: 0.95,
            steps: 19,
            allergen_recall_target: 0.97,
            diet_recall_target: 0.90,
            per_label_min_steps: 25,
        }
    }
}

impl TunerConfig {
    pub fn with_range(mut self, min_threshold: f32, max_threshold: f32) -> Self {
        self.min_threshold = min_threshold;
        self.max_threshold = max_threshold;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_allergen_recall_target(mut self, target: f64) -> Self {
        self.allergen_recall_target = target;
        self
    }

    pub fn with_diet_recall_target(mut self, target: f64) -> Self {
        self.diet_recall_target = target;
        self
    }
}

/// Linearly spaced thresholds between the clamped bounds, both included.
///
/// `steps <= 1` yields only the lower bound. Reversed bounds are swapped.
pub fn threshold_grid(min_threshold: f32, max_threshold: f32, steps: usize) -> Vec<f32> {
    if steps <= 1 {
        return vec![clamp01(min_threshold)];
    }
    let mut lo = clamp01(min_threshold);
    let mut hi = clamp01(max_threshold);
    if hi < lo {
        std::mem::swap(&mut lo, &mut hi);
    }
    let span = f64::from(hi - lo);
    let mut grid: Vec<f32> = (0..steps)
        .map(|index| (f64::from(lo) + span * index as f64 / (steps - 1) as f64) as f32)
        .collect();
    grid[steps - 1] = hi;
    grid
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub min: f32,
    pub max: f32,
    pub steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEvaluation {
    pub threshold: f32,
    pub metrics: MetricsReport,
}

/// Outcome of the per-label search for one label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelThreshold {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: LabelKind,
    pub support: u64,
    pub threshold: f32,
    pub precision: f64,
    pub recall: f64,
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerLabelTuning {
    /// One threshold per label, in label-space order
    pub thresholds: Vec<f32>,
    pub per_label: Vec<LabelThreshold>,
    pub metrics: MetricsReport,
}

impl PerLabelTuning {
    pub fn threshold(&self) -> Threshold {
        Threshold::PerLabel(self.thresholds.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub grid: GridBounds,
    pub best_recall_priority: ThresholdEvaluation,
    pub best_f1_priority: ThresholdEvaluation,
    pub sweep: Vec<ThresholdEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_label_threshold_recall_priority: Option<PerLabelTuning>,
}

/// Ranks a report when safety (allergen recall) matters most.
pub fn recall_priority_key(metrics: &MetricsReport) -> [f64; 3] {
    [metrics.allergens.recall, metrics.allergens.precision, metrics.overall.f1]
}

/// Ranks a report by overall F1 first.
pub fn f1_priority_key(metrics: &MetricsReport) -> [f64; 3] {
    [metrics.overall.f1, metrics.allergens.recall, metrics.allergens.precision]
}

/// Grid search over decision thresholds.
#[derive(Debug, Clone, Default)]
pub struct ThresholdTuner {
    config: TunerConfig,
}

impl ThresholdTuner {
    pub fn new(config: TunerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn grid(&self) -> Vec<f32> {
        threshold_grid(self.config.min_threshold, self.config.max_threshold, self.config.steps)
    }

    /// Metrics at every global threshold of the grid.
    pub fn sweep(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        label_space: &LabelSpace,
    ) -> Result<Vec<ThresholdEvaluation>, ClassifierError> {
        self.grid()
            .into_iter()
            .map(|threshold| {
                summarize(logits, targets, label_space, &Threshold::Global(threshold))
                    .map(|metrics| ThresholdEvaluation { threshold, metrics })
            })
            .collect()
    }

    /// Runs the global search and, if `per_label` is set, the per-label one.
    ///
    /// # Errors
    /// - `LabelSpaceMismatch` if the matrices are not `output_dim` wide
    pub fn tune(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        label_space: &LabelSpace,
        per_label: bool,
    ) -> Result<TuningReport, ClassifierError> {
        let sweep = self.sweep(logits, targets, label_space)?;
        let best_recall_priority = select_best(&sweep, recall_priority_key);
        let best_f1_priority = select_best(&sweep, f1_priority_key);

        let per_label_tuning = if per_label {
            Some(self.tune_per_label(logits, targets, label_space)?)
        } else {
            None
        };

        Ok(TuningReport {
            dataset: None,
            grid: GridBounds {
                min: self.config.min_threshold,
                max: self.config.max_threshold,
                steps: self.config.steps,
            },
            best_recall_priority,
            best_f1_priority,
            sweep,
            per_label_threshold_recall_priority: per_label_tuning,
        })
    }

    /// Chooses a threshold for every label independently.
    ///
    /// Among grid points meeting the label's recall target the highest
    /// precision wins; otherwise the highest recall. Remaining ties go to the
    /// larger threshold. Labels without positives are pinned to 1.0.
    pub fn tune_per_label(
        &self,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        label_space: &LabelSpace,
    ) -> Result<PerLabelTuning, ClassifierError> {
        let output_dim = label_space.output_dim();
        if logits.ncols() != output_dim || targets.ncols() != output_dim {
            return Err(ClassifierError::LabelSpaceMismatch {
                expected: output_dim,
                actual: logits.ncols().min(targets.ncols()),
            });
        }

        let steps = self.config.steps.max(self.config.per_label_min_steps);
        let grid = threshold_grid(self.config.min_threshold, self.config.max_threshold, steps);
        let probabilities = sigmoid_matrix(logits);
        let support = label_support(targets);

        let mut thresholds = Vec::with_capacity(output_dim);
        let mut per_label = Vec::with_capacity(output_dim);

        for (index, label) in label_space.labels().enumerate() {
            let kind = label_space.kind_of(index);
            if support[index] == 0 {
                debug!("Label '{}' has no positives; pinning threshold", label);
                thresholds.push(1.0);
                per_label.push(LabelThreshold {
                    label: label.to_string(),
                    kind,
                    support: 0,
                    threshold: 1.0,
                    precision: 0.0,
                    recall: 0.0,
                    tp: 0,
                    fp: 0,
                    fn_: 0,
                    note: Some(PINNED_NOTE.to_string()),
                });
                continue;
            }

            let recall_target = match kind {
                LabelKind::Allergen => self.config.allergen_recall_target,
                LabelKind::Diet => self.config.diet_recall_target,
            };

            let mut best_meeting_target: Option<([f64; 2], f32, Confusion)> = None;
            let mut best_fallback: Option<([f64; 3], f32, Confusion)> = None;
            for &threshold in &grid {
                let counts = Confusion::for_label(probabilities.view(), targets, index, threshold);
                let precision = safe_div(counts.tp as f64, (counts.tp + counts.fp) as f64);
                let recall = safe_div(counts.tp as f64, (counts.tp + counts.fn_) as f64);

                let fallback_key = [recall, precision, f64::from(threshold)];
                if best_fallback.as_ref().map_or(true, |(key, _, _)| fallback_key > *key) {
                    best_fallback = Some((fallback_key, threshold, counts));
                }
                if recall >= recall_target {
                    let key = [precision, f64::from(threshold)];
                    if best_meeting_target.as_ref().map_or(true, |(best, _, _)| key > *best) {
                        best_meeting_target = Some((key, threshold, counts));
                    }
                }
            }

            let chosen = best_meeting_target
                .map(|(_, threshold, counts)| (threshold, counts))
                .or_else(|| best_fallback.map(|(_, threshold, counts)| (threshold, counts)));
            let (threshold, counts) = chosen.unwrap_or((1.0, Confusion::default()));

            thresholds.push(threshold);
            per_label.push(LabelThreshold {
                label: label.to_string(),
                kind,
                support: support[index],
                threshold,
                precision: safe_div(counts.tp as f64, (counts.tp + counts.fp) as f64),
                recall: safe_div(counts.tp as f64, (counts.tp + counts.fn_) as f64),
                tp: counts.tp,
                fp: counts.fp,
                fn_: counts.fn_,
                note: None,
            });
        }

        let metrics = summarize(logits, targets, label_space, &Threshold::PerLabel(thresholds.clone()))?;
        Ok(PerLabelTuning {
            thresholds,
            per_label,
            metrics,
        })
    }
}

/// First sweep entry with the strictly greatest key.
fn select_best(sweep: &[ThresholdEvaluation], key: fn(&MetricsReport) -> [f64; 3]) -> ThresholdEvaluation {
    let mut best: Option<(&ThresholdEvaluation, [f64; 3])> = None;
    for candidate in sweep {
        let score = key(&candidate.metrics);
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }
    best.map(|(evaluation, _)| evaluation.clone())
        .unwrap_or_else(|| ThresholdEvaluation {
            threshold: 0.5,
            metrics: MetricsReport::default(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn logit(p: f32) -> f32 {
        (p / (1.0 - p)).ln()
    }

    #[test]
    fn test_grid_single_step_is_min() {
        assert_eq!(threshold_grid(0.3, 0.9, 1), vec![0.3]);
        assert_eq!(threshold_grid(0.3, 0.9, 0), vec![0.3]);
        assert_eq!(threshold_grid(-1.0, 0.9, 1), vec![0.0]);
    }

    #[test]
    fn test_grid_includes_both_bounds() {
        let grid = threshold_grid(0.05, 0.95, 19);
        assert_eq!(grid.len(), 19);
        assert_eq!(grid[0], 0.05);
        assert_eq!(grid[18], 0.95);
        assert!((grid[1] - 0.10).abs() < 1e-6);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_grid_swaps_and_clamps() {
        assert_eq!(threshold_grid(1.5, 0.5, 3), vec![0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_recall_priority_prefers_low_threshold() {
        let space = LabelSpace::new(["milk"], ["Vegan"]).unwrap();
        // milk positive at p=0.25 is only caught by low thresholds
        let logits = array![[logit(0.25), logit(0.9)], [logit(0.8), logit(0.05)], [logit(0.15), logit(0.05)]];
        let targets = array![[1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
        let tuner = ThresholdTuner::new(TunerConfig::default().with_range(0.1, 0.9).with_steps(9));
        let report = tuner.tune(logits.view(), targets.view(), &space, false).unwrap();

        assert_eq!(report.sweep.len(), 9);
        assert_eq!(report.best_recall_priority.metrics.allergens.recall, 1.0);
        assert!(report.best_recall_priority.threshold <= 0.2 + 1e-6);
        // 0.2 keeps recall 1.0 and drops the p=0.15 false positive
        assert!(report.best_recall_priority.threshold > 0.1 + 1e-6);
        assert!(report.best_f1_priority.metrics.overall.f1 >= report.best_recall_priority.metrics.overall.f1);
        assert!(report.per_label_threshold_recall_priority.is_none());
    }

    #[test]
    fn test_first_threshold_wins_ties() {
        let space = LabelSpace::new(["milk"], Vec::<String>::new()).unwrap();
        let logits = array![[logit(0.99)], [logit(0.01)]];
        let targets = array![[1.0], [0.0]];
        let tuner = ThresholdTuner::new(TunerConfig::default());
        let report = tuner.tune(logits.view(), targets.view(), &space, false).unwrap();
        // every grid point is perfect, so the first one is kept
        assert_eq!(report.best_recall_priority.threshold, 0.05);
        assert_eq!(report.best_f1_priority.threshold, 0.05);
    }

    #[test]
    fn test_per_label_pins_unsupported_labels() {
        let space = LabelSpace::new(["milk", "peanut"], ["Vegan"]).unwrap();
        let logits = array![[logit(0.7), logit(0.6), logit(0.4)], [logit(0.2), logit(0.9), logit(0.3)]];
        let targets = array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let tuner = ThresholdTuner::new(TunerConfig::default());
        let tuning = tuner.tune_per_label(logits.view(), targets.view(), &space).unwrap();

        assert_eq!(tuning.thresholds.len(), 3);
        assert_eq!(tuning.thresholds[1], 1.0);
        assert_eq!(tuning.thresholds[2], 1.0);
        assert_eq!(tuning.per_label[1].note.as_deref(), Some(PINNED_NOTE));
        // milk: highest-precision threshold with full recall lies in (0.2, 0.7]
        assert!(tuning.thresholds[0] > 0.2 && tuning.thresholds[0] <= 0.7);
        assert_eq!(tuning.per_label[0].precision, 1.0);
        assert_eq!(tuning.metrics.allergens.recall, 1.0);
        assert_eq!(tuning.metrics.allergens.false_positives, 0);
    }

    #[test]
    fn test_per_label_fallback_maximises_recall() {
        let space = LabelSpace::new(["milk"], Vec::<String>::new()).unwrap();
        // one positive sits below the whole grid; recall target is unreachable
        let logits = array![[logit(0.01)], [logit(0.8)], [logit(0.6)]];
        let targets = array![[1.0], [1.0], [0.0]];
        let tuner = ThresholdTuner::new(TunerConfig::default());
        let tuning = tuner.tune_per_label(logits.view(), targets.view(), &space).unwrap();
        let row = &tuning.per_label[0];
        assert_eq!(row.recall, 0.5);
        // among recall-0.5 thresholds, precision 1.0 needs t > 0.6
        assert_eq!(row.precision, 1.0);
        assert!(row.threshold > 0.6 && row.threshold <= 0.8);
    }

    #[test]
    fn test_empty_input_gives_zero_report() {
        let space = LabelSpace::new(["milk"], ["Vegan"]).unwrap();
        let empty = Array2::<f32>::zeros((0, 2));
        let report = ThresholdTuner::default().tune(empty.view(), empty.view(), &space, true).unwrap();
        assert_eq!(report.best_recall_priority.metrics, MetricsReport::default());
        let per_label = report.per_label_threshold_recall_priority.unwrap();
        assert_eq!(per_label.thresholds, vec![1.0, 1.0]);
    }

    #[test]
    fn test_report_json_keys() {
        let space = LabelSpace::new(["milk"], Vec::<String>::new()).unwrap();
        let logits = array![[2.0]];
        let targets = array![[1.0]];
        let report = ThresholdTuner::default().tune(logits.view(), targets.view(), &space, true).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["grid"]["steps"], 19);
        assert!(json["per_label_threshold_recall_priority"]["thresholds"].is_array());
        assert!(json.get("dataset").is_none());
    }
}
