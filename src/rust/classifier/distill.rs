//! Active-learning support: ranks rows for teacher re-labeling and turns
//! teacher outcomes back into training rows.
//!
//! Nothing here talks to the teacher; the connector lives outside the crate
//! and only hands back [`TeacherLabel`] records.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::classifier::Classifier;
use super::dataset::Row;
use super::error::ClassifierError;
use super::labels::LabelSpace;
use super::utils::{clamp01, safe_div};

pub const TEACHER_SOURCE: &str = "teacher_distilled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Top-ranked rows kept before picking
    pub candidate_pool: usize,
    pub max_examples: usize,
    /// Probability at which the student counts an allergen as predicted
    pub student_threshold: f32,
    pub uncertainty_weight: f64,
    pub mismatch_weight: f64,
    pub min_teacher_confidence: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            candidate_pool: 12000,
            max_examples: 1200,
            student_threshold: 0.5,
            uncertainty_weight: 0.65,
            mismatch_weight: 0.35,
            min_teacher_confidence: 0.65,
        }
    }
}

impl DistillConfig {
    pub fn with_candidate_pool(mut self, candidate_pool: usize) -> Self {
        self.candidate_pool = candidate_pool;
        self
    }

    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = max_examples;
        self
    }

    pub fn with_student_threshold(mut self, threshold: f32) -> Self {
        self.student_threshold = threshold;
        self
    }

    pub fn with_weights(mut self, uncertainty_weight: f64, mismatch_weight: f64) -> Self {
        self.uncertainty_weight = uncertainty_weight;
        self.mismatch_weight = mismatch_weight;
        self
    }

    pub fn with_min_teacher_confidence(mut self, confidence: f64) -> Self {
        self.min_teacher_confidence = confidence;
        self
    }
}

/// A row ranked for teacher re-labeling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub text: String,
    pub weak_allergens: Vec<String>,
    pub student_predicted: Vec<String>,
    pub student_uncertainty: f64,
    pub student_mismatch_rate: f64,
    pub distill_score: f64,
}

/// Student diagnostics for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentScore {
    pub predicted: BTreeSet<String>,
    pub uncertainty: f64,
    pub mismatch_rate: f64,
    pub score: f64,
}

/// Scores one row from its allergen probabilities.
///
/// `uncertainty = 1 - 2 * mean|p - 0.5|`, zero when there are no allergen
/// labels. `mismatch_rate` is the symmetric difference between predicted and
/// weak allergens over the number of allergen labels.
pub fn score_student(
    allergen_probabilities: &[f32],
    allergen_labels: &[String],
    weak: &BTreeSet<String>,
    config: &DistillConfig,
) -> StudentScore {
    let uncertainty = if allergen_probabilities.is_empty() {
        0.0
    } else {
        let margin = allergen_probabilities
            .iter()
            .map(|&p| f64::from((p - 0.5).abs()))
            .sum::<f64>()
            / allergen_probabilities.len() as f64;
        f64::from(clamp01((1.0 - 2.0 * margin) as f32))
    };

    let threshold = clamp01(config.student_threshold);
    let predicted: BTreeSet<String> = allergen_probabilities
        .iter()
        .zip(allergen_labels.iter())
        .filter(|(p, _)| **p >= threshold)
        .map(|(_, label)| label.clone())
        .collect();

    let mismatch = predicted.symmetric_difference(weak).count();
    let mismatch_rate = safe_div(mismatch as f64, allergen_labels.len().max(1) as f64);
    let score = config.uncertainty_weight * uncertainty + config.mismatch_weight * mismatch_rate;

    StudentScore {
        predicted,
        uncertainty,
        mismatch_rate,
        score,
    }
}

/// Scores every row with non-empty text, in input order.
///
/// Weak labels are the row's allergens restricted to the classifier's
/// allergen labels.
pub fn build_candidates(
    classifier: &Classifier,
    rows: &[Row],
    config: &DistillConfig,
) -> Result<Vec<Candidate>, ClassifierError> {
    let dataset = classifier.encode(rows)?;
    if dataset.is_empty() {
        return Ok(Vec::new());
    }
    let probabilities = classifier.probabilities(&dataset)?;
    let label_space: &LabelSpace = classifier.label_space();
    let allergen_labels = &label_space.allergens;
    let known: HashSet<&str> = allergen_labels.iter().map(String::as_str).collect();

    let candidates = dataset
        .source_rows
        .iter()
        .enumerate()
        .map(|(sample, &position)| {
            let row = &rows[position];
            let weak: BTreeSet<String> = row
                .allergens
                .iter()
                .map(|label| label.trim())
                .filter(|label| known.contains(label))
                .map(str::to_string)
                .collect();
            let allergen_probs: Vec<f32> = label_space
                .allergen_range()
                .map(|label| probabilities[[sample, label]])
                .collect();
            let scored = score_student(&allergen_probs, allergen_labels, &weak, config);
            Candidate {
                id: row.id.trim().to_string(),
                text: row.text.trim().to_string(),
                weak_allergens: weak.into_iter().collect(),
                student_predicted: scored.predicted.into_iter().collect(),
                student_uncertainty: scored.uncertainty,
                student_mismatch_rate: scored.mismatch_rate,
                distill_score: scored.score,
            }
        })
        .collect();
    Ok(candidates)
}

/// Outcome of [`select_candidates`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidate_rows: usize,
    pub pool_size: usize,
    pub selected: Vec<Candidate>,
    /// Picked rows dropped because their id was already distilled
    pub skipped_existing: usize,
}

/// Sorts by score (descending, stable), keeps the top `candidate_pool`, then
/// picks the first `max_examples` of the pool, finally dropping ids present
/// in `already_distilled`.
pub fn select_candidates(
    mut candidates: Vec<Candidate>,
    config: &DistillConfig,
    already_distilled: &HashSet<String>,
) -> Selection {
    let candidate_rows = candidates.len();
    candidates.sort_by(|a, b| b.distill_score.total_cmp(&a.distill_score));

    let pool_size = candidate_rows.min(config.candidate_pool.max(1));
    candidates.truncate(pool_size);
    candidates.truncate(config.max_examples.max(1).min(pool_size));

    let before = candidates.len();
    candidates.retain(|candidate| !already_distilled.contains(&candidate.id));
    let skipped_existing = before - candidates.len();
    if skipped_existing > 0 {
        debug!("Resume filter dropped {} already distilled rows", skipped_existing);
    }

    Selection {
        candidate_rows,
        pool_size,
        selected: candidates,
        skipped_existing,
    }
}

/// Labels returned by the external teacher for one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeacherLabel {
    pub id: String,
    pub allergens: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeSummary {
    pub outcomes: usize,
    pub accepted_rows: usize,
    pub rejected_low_confidence: usize,
    pub rejected_empty_allergens: usize,
    /// Outcomes whose id matches no selected candidate
    pub rejected_unknown_id: usize,
    pub total_output_rows: usize,
}

impl fmt::Display for IntakeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outcomes={} accepted={} rejected_low_confidence={} rejected_empty_allergens={} rejected_unknown_id={} total_output_rows={}",
            self.outcomes,
            self.accepted_rows,
            self.rejected_low_confidence,
            self.rejected_empty_allergens,
            self.rejected_unknown_id,
            self.total_output_rows
        )
    }
}

/// Converts teacher outcomes into training rows.
///
/// Teacher allergens outside `allowed` are discarded; an outcome left with
/// none, or with confidence below `min_teacher_confidence`, is rejected.
/// Accepted rows are merged with `existing` (from an earlier intake),
/// deduplicated by id keeping the most confident teacher answer, and sorted
/// by id.
pub fn accept_teacher_labels(
    selected: &[Candidate],
    outcomes: &[TeacherLabel],
    existing: Vec<Row>,
    allowed: &LabelSpace,
    config: &DistillConfig,
) -> (Vec<Row>, IntakeSummary) {
    let by_id: BTreeMap<&str, &Candidate> = selected.iter().map(|c| (c.id.as_str(), c)).collect();
    let allowed: HashSet<&str> = allowed.allergens.iter().map(String::as_str).collect();
    let mut summary = IntakeSummary {
        outcomes: outcomes.len(),
        ..IntakeSummary::default()
    };

    let mut rows = existing;
    for outcome in outcomes {
        let id = outcome.id.trim();
        let Some(candidate) = by_id.get(id) else {
            summary.rejected_unknown_id += 1;
            continue;
        };

        let mut seen = HashSet::new();
        let allergens: Vec<String> = outcome
            .allergens
            .iter()
            .map(|label| label.trim())
            .filter(|label| allowed.contains(label) && seen.insert(*label))
            .map(str::to_string)
            .collect();
        let confidence = outcome.confidence.clamp(0.0, 1.0);

        if allergens.is_empty() {
            summary.rejected_empty_allergens += 1;
            continue;
        }
        if confidence < config.min_teacher_confidence {
            summary.rejected_low_confidence += 1;
            continue;
        }

        let mut meta = Map::new();
        meta.insert("teacher_confidence".into(), json!(confidence));
        meta.insert("student_uncertainty".into(), json!(candidate.student_uncertainty));
        meta.insert("student_mismatch_rate".into(), json!(candidate.student_mismatch_rate));
        meta.insert("weak_allergens".into(), json!(candidate.weak_allergens));
        meta.insert("student_predicted".into(), json!(candidate.student_predicted));

        rows.push(Row {
            id: id.to_string(),
            text: candidate.text.clone(),
            allergens,
            diets: Vec::new(),
            source: TEACHER_SOURCE.to_string(),
            meta,
        });
        summary.accepted_rows += 1;
    }

    let mut deduped: BTreeMap<String, Row> = BTreeMap::new();
    for row in rows {
        let id = row.id.trim().to_string();
        if id.is_empty() {
            continue;
        }
        let confidence = teacher_confidence(&row).unwrap_or(0.0);
        let replace = deduped
            .get(&id)
            .map_or(true, |current| confidence >= teacher_confidence(current).unwrap_or(-1.0));
        if replace {
            deduped.insert(id, row);
        }
    }

    let rows: Vec<Row> = deduped.into_values().collect();
    summary.total_output_rows = rows.len();
    info!("Teacher intake: {}", summary);
    (rows, summary)
}

fn teacher_confidence(row: &Row) -> Option<f64> {
    row.meta.get("teacher_confidence").and_then(Value::as_f64)
}
