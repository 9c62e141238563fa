use std::collections::HashSet;

use allergen_classifier::classifier::distill::{
    accept_teacher_labels, build_candidates, select_candidates, TeacherLabel, TEACHER_SOURCE,
};
use allergen_classifier::classifier::tuning::TuningReport;
use allergen_classifier::io::{read_json, write_json};
use allergen_classifier::{
    Classifier, DistillConfig, LabelSpace, MemorySink, Row, Threshold, ThresholdTuner, TrainConfig, Trainer,
    TunerConfig,
};
use env_logger::{Builder, Env};
use tempfile::tempdir;

// Initialize test logger
fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn")).try_init();
}

fn label_space() -> LabelSpace {
    LabelSpace::new(["peanut", "milk", "egg"], ["Vegan"]).unwrap()
}

fn rows() -> Vec<Row> {
    vec![
        Row::new("p1", "peanut butter cookies").with_allergens(vec!["peanut"]),
        Row::new("p2", "salted roasted peanuts").with_allergens(vec!["peanut"]),
        Row::new("m1", "whole milk yogurt").with_allergens(vec!["milk"]),
        Row::new("m2", "creamy milk latte").with_allergens(vec!["milk"]),
        Row::new("v1", "steamed broccoli rice").with_diets(vec!["Vegan"]),
        Row::new("v2", "lentil tomato soup").with_diets(vec!["Vegan"]),
    ]
}

fn trained_classifier() -> Classifier {
    let rows = rows();
    let trainer = Trainer::new(TrainConfig::default().with_feature_dim(512).with_epochs(30));
    let run = trainer
        .fit_rows(&rows, &rows, &label_space(), &mut MemorySink::default())
        .unwrap();
    Classifier::builder().with_artifact(run.artifact).build().unwrap()
}

#[test]
fn test_tuning_report_and_per_label_thresholds() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let mut classifier = trained_classifier();
    let dataset = classifier.encode(&rows())?;
    let logits = classifier.logits(&dataset)?;
    let targets = dataset.target_matrix();

    let tuner = ThresholdTuner::new(TunerConfig::default());
    let report = tuner.tune(logits.view(), targets.view(), classifier.label_space(), true)?;
    assert_eq!(report.sweep.len(), 19);
    assert_eq!(report.grid.steps, 19);
    assert!(report.sweep.iter().any(|point| point.threshold == report.best_recall_priority.threshold));

    let per_label = report.per_label_threshold_recall_priority.clone().unwrap();
    assert_eq!(per_label.thresholds.len(), 4);
    // egg has no positives
    assert_eq!(per_label.thresholds[2], 1.0);
    assert!(per_label.per_label[2].note.is_some());

    // the report survives a trip through disk and feeds evaluation
    let dir = tempdir()?;
    let path = dir.path().join("threshold_tuning.json");
    write_json(&path, &report)?;
    let reloaded: TuningReport = read_json(&path)?;
    classifier.set_threshold(reloaded.per_label_threshold_recall_priority.unwrap().threshold())?;

    let evaluation = classifier.evaluate(&rows())?;
    assert_eq!(evaluation.metrics.allergens.recall, 1.0);
    assert_eq!(evaluation.metrics.diets.recall, 1.0);

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    for key in ["grid", "best_recall_priority", "best_f1_priority", "sweep", "per_label_threshold_recall_priority"] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
    Ok(())
}

#[test]
fn test_global_threshold_override_is_clamped() {
    let mut classifier = trained_classifier();
    classifier.set_threshold(Threshold::global(3.0)).unwrap();
    assert_eq!(classifier.threshold(), &Threshold::Global(1.0));
    assert!(classifier.set_threshold(Threshold::PerLabel(vec![0.5])).is_err());
}

#[test]
fn test_candidate_selection_and_teacher_intake() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let classifier = trained_classifier();
    let mut rows = rows();
    // weak label disagrees with what the student learned
    rows.push(Row::new("x1", "peanut butter cookies").with_allergens(vec!["milk", "egg", "mustard"]));
    rows.push(Row::new("x2", "   "));

    let config = DistillConfig::default().with_max_examples(3);
    let candidates = build_candidates(&classifier, &rows, &config)?;
    assert_eq!(candidates.len(), 7);
    let odd = candidates.iter().find(|c| c.id == "x1").unwrap();
    assert_eq!(odd.weak_allergens, vec!["egg", "milk"]);
    assert_eq!(odd.student_predicted, vec!["peanut"]);
    assert_eq!(odd.student_mismatch_rate, 1.0);

    let done: HashSet<String> = ["p1".to_string()].into_iter().collect();
    let selection = select_candidates(candidates, &config, &done);
    assert_eq!(selection.candidate_rows, 7);
    assert_eq!(selection.pool_size, 7);
    assert!(selection.selected.len() <= 3);
    assert!(selection.selected.iter().all(|c| c.id != "p1"));
    assert!(selection
        .selected
        .windows(2)
        .all(|pair| pair[0].distill_score >= pair[1].distill_score));
    assert_eq!(selection.selected[0].id, "x1");

    let outcomes = vec![
        TeacherLabel {
            id: "x1".into(),
            allergens: vec!["peanut".into(), "wheat".into()],
            confidence: 0.9,
        },
        TeacherLabel {
            id: "x1".into(),
            allergens: vec!["peanut".into(), "egg".into()],
            confidence: 0.7,
        },
        TeacherLabel {
            id: "nope".into(),
            allergens: vec!["milk".into()],
            confidence: 0.99,
        },
    ];
    let (accepted, summary) =
        accept_teacher_labels(&selection.selected, &outcomes, Vec::new(), classifier.label_space(), &config);
    assert_eq!(summary.outcomes, 3);
    assert_eq!(summary.rejected_unknown_id, 1);
    assert_eq!(summary.accepted_rows, 2);
    assert_eq!(summary.total_output_rows, 1);
    assert_eq!(accepted[0].allergens, vec!["peanut"]);
    assert_eq!(accepted[0].source, TEACHER_SOURCE);
    assert_eq!(accepted[0].meta["teacher_confidence"], serde_json::json!(0.9));
    Ok(())
}
