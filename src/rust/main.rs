use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use allergen_classifier::classifier::distill::{accept_teacher_labels, build_candidates, select_candidates};
use allergen_classifier::classifier::tuning::TuningReport;
use allergen_classifier::classifier::{BagMode, Candidate, EncodedDataset, TeacherLabel};
use allergen_classifier::io::{read_json, read_jsonl, read_rows, write_json, write_jsonl};
use allergen_classifier::{
    ArtifactRegistry, Classifier, DataSummary, Device, DistillConfig, FsArtifactRegistry, LabelSpace, LoadSummary,
    MetricsReport, ModelConfig, ModelMode, Row, RunDir, RuntimeConfig, Threshold, ThresholdTuner, TrainConfig,
    Trainer, TunerConfig,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Registry root; defaults to $ALLERGEN_ARTIFACTS or the platform data directory
    #[arg(long, global = true)]
    artifact_root: Option<PathBuf>,

    /// Compute backend (auto, cpu)
    #[arg(long, global = true, default_value = "auto")]
    device: String,

    /// Threads used for feature hashing (0 = one per core)
    #[arg(long, global = true, default_value_t = 0)]
    encode_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model and register the run
    Train(TrainArgs),
    /// Score a dataset with a trained model
    Evaluate(EvaluateArgs),
    /// Sweep decision thresholds on a dataset
    Tune(TuneArgs),
    /// Rank rows for teacher re-labeling
    Select(SelectArgs),
    /// Turn teacher outcomes into training rows
    Intake(IntakeArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Linear,
    Mlp,
}

#[derive(Clone, Copy, ValueEnum)]
enum BagArg {
    Sum,
    Mean,
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long, default_value = "ml/data/processed/train.jsonl")]
    train_file: PathBuf,
    /// Validation rows; checkpoints use training metrics when absent
    #[arg(long)]
    val_file: Option<PathBuf>,
    /// Label space JSON fixing the output ordering
    #[arg(long, default_value = "ml/data/processed/label_space.json")]
    label_space_file: PathBuf,
    #[arg(long, default_value_t = 32768)]
    feature_dim: usize,
    #[arg(long, default_value_t = 40)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 0.05)]
    lr: f32,
    #[arg(long, default_value_t = 1e-4)]
    weight_decay: f32,
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    #[arg(long, default_value_t = 15.0)]
    pos_weight_clamp: f32,
    #[arg(long, default_value_t = 1)]
    print_every: usize,
    #[arg(long, value_enum, default_value = "linear")]
    mode: ModeArg,
    #[arg(long, default_value_t = 256)]
    embed_dim: usize,
    #[arg(long, default_value_t = 256)]
    hidden_dim: usize,
    #[arg(long, default_value_t = 0.15)]
    dropout: f32,
    #[arg(long, value_enum, default_value = "sum")]
    bag_mode: BagArg,
}

#[derive(Args)]
struct ArtifactArgs {
    /// Run id, run directory, model.json path, or "latest"
    #[arg(long, default_value = "latest")]
    artifact: String,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long, default_value = "ml/data/processed/val.jsonl")]
    dataset: PathBuf,
    #[command(flatten)]
    artifact: ArtifactArgs,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    /// Override the decision threshold (clamped to 0..1)
    #[arg(long, conflicts_with = "threshold_file")]
    threshold: Option<f32>,
    /// Tuning report whose per-label thresholds replace the stored threshold
    #[arg(long)]
    threshold_file: Option<PathBuf>,
}

#[derive(Args)]
struct TuneArgs {
    #[arg(long, default_value = "ml/data/processed/val.jsonl")]
    dataset: PathBuf,
    #[command(flatten)]
    artifact: ArtifactArgs,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 0.05)]
    min_threshold: f32,
    #[arg(long, default_value_t = 0.95)]
    max_threshold: f32,
    #[arg(long, default_value_t = 19)]
    steps: usize,
    #[arg(long, default_value_t = 0.97)]
    allergen_recall_target: f64,
    #[arg(long, default_value_t = 0.90)]
    diet_recall_target: f64,
    /// Also tune one threshold per label
    #[arg(long)]
    per_label: bool,
}

#[derive(Args)]
struct SelectArgs {
    #[arg(long, default_value = "ml/data/processed/train.jsonl")]
    input: PathBuf,
    /// Ranked candidates, one JSON object per line
    #[arg(long, default_value = "ml/data/processed/distill_candidates.jsonl")]
    output: PathBuf,
    #[command(flatten)]
    artifact: ArtifactArgs,
    #[arg(long, default_value_t = 12000)]
    candidate_pool: usize,
    #[arg(long, default_value_t = 1200)]
    max_examples: usize,
    #[arg(long, default_value_t = 0.5)]
    student_threshold: f32,
    #[arg(long, default_value_t = 512)]
    batch_size: usize,
    /// Rows already distilled; their ids are skipped
    #[arg(long)]
    exclude: Option<PathBuf>,
    #[arg(long)]
    summary_output: Option<PathBuf>,
}

#[derive(Args)]
struct IntakeArgs {
    /// Candidates written by `select`
    #[arg(long, default_value = "ml/data/processed/distill_candidates.jsonl")]
    candidates: PathBuf,
    /// Teacher outcomes: {"id", "allergens", "confidence"} per line
    #[arg(long)]
    outcomes: PathBuf,
    #[arg(long, default_value = "ml/data/processed/teacher_distilled.jsonl")]
    output: PathBuf,
    /// Label space restricting the accepted allergens; defaults to the artifact's
    #[arg(long)]
    label_space_file: Option<PathBuf>,
    #[command(flatten)]
    artifact: ArtifactArgs,
    #[arg(long, default_value_t = 0.65)]
    min_teacher_confidence: f64,
    /// Merge with rows already present in the output file
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    summary_output: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunConfig<'a> {
    created_at_utc: String,
    train_file: &'a Path,
    val_file: Option<&'a Path>,
    label_space: &'a LabelSpace,
    train: DataSummary,
    val: DataSummary,
    train_config: &'a TrainConfig,
    runtime: &'a RuntimeConfig,
}

#[derive(Serialize)]
struct EvaluationReport<'a> {
    artifact_dir: &'a Path,
    dataset: &'a Path,
    rows: usize,
    threshold: &'a Threshold,
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold_file: Option<&'a Path>,
    data: DataSummary,
    metrics: &'a MetricsReport,
}

#[derive(Serialize)]
struct SelectionSummary<'a> {
    input: &'a Path,
    output: &'a Path,
    artifact_dir: &'a Path,
    load: LoadSummary,
    candidate_rows: usize,
    pool_size: usize,
    selected: usize,
    skipped_existing: usize,
    config: &'a DistillConfig,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = RuntimeConfig::default()
        .with_device(Device::parse(&cli.device)?)
        .with_encode_threads(cli.encode_threads);
    let registry = FsArtifactRegistry::open(cli.artifact_root.clone()).context("Failed to open artifact registry")?;
    info!("Artifact registry at {}", registry.root().display());

    let start_time = Instant::now();
    match cli.command {
        Command::Train(args) => train(&registry, runtime, args)?,
        Command::Evaluate(args) => evaluate(&registry, runtime, args)?,
        Command::Tune(args) => tune(&registry, runtime, args)?,
        Command::Select(args) => select(&registry, runtime, args)?,
        Command::Intake(args) => intake(&registry, args)?,
    }
    info!("Done in {:.2?}", start_time.elapsed());
    Ok(())
}

fn train(registry: &FsArtifactRegistry, runtime: RuntimeConfig, args: TrainArgs) -> Result<()> {
    let label_space = LabelSpace::from_file(&args.label_space_file)
        .with_context(|| format!("Training inputs missing: label space {}", args.label_space_file.display()))?;

    let (train_rows, train_load) =
        read_rows(&args.train_file).with_context(|| format!("Failed to read {}", args.train_file.display()))?;
    let (val_rows, val_load) = match &args.val_file {
        Some(path) => read_rows(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => (Vec::new(), LoadSummary::default()),
    };

    let model = ModelConfig::default()
        .with_mode(match args.mode {
            ModeArg::Linear => ModelMode::Linear,
            ModeArg::Mlp => ModelMode::Mlp,
        })
        .with_embed_dim(args.embed_dim)
        .with_hidden_dim(args.hidden_dim)
        .with_dropout(args.dropout)
        .with_bag_mode(match args.bag_mode {
            BagArg::Sum => BagMode::Sum,
            BagArg::Mean => BagMode::Mean,
        });
    let config = TrainConfig::default()
        .with_feature_dim(args.feature_dim)
        .with_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.lr)
        .with_weight_decay(args.weight_decay)
        .with_threshold(args.threshold)
        .with_seed(args.seed)
        .with_pos_weight_clamp(args.pos_weight_clamp)
        .with_log_every(args.print_every)
        .with_model(model);
    let trainer = Trainer::new(config).with_runtime_config(runtime.clone());

    let (train, val) = trainer.encode(&train_rows, &val_rows, &label_space)?;
    let train_summary = DataSummary::new(train_load, train.summary);
    let val_summary = DataSummary::new(val_load, val.summary);
    println!("Train rows: {}", train_summary);
    println!("Validation rows: {}", val_summary);

    let run = registry.create_run()?;
    write_json(
        run.file("config.json"),
        &RunConfig {
            created_at_utc: chrono::Utc::now().to_rfc3339(),
            train_file: &args.train_file,
            val_file: args.val_file.as_deref(),
            label_space: &label_space,
            train: train_summary,
            val: val_summary,
            train_config: trainer.config(),
            runtime: &runtime,
        },
    )?;

    let mut sink = run.sink();
    let trained = trainer.fit(&train, &val, &mut sink).context("Training failed")?;
    let entry = registry.commit(&run)?;

    let best_metrics = if trained.val_rows > 0 {
        &trained.best.val_metrics
    } else {
        &trained.best.train_metrics
    };
    println!("Saved model artifact to: {}", run.path.display());
    println!(
        "Best epoch={} allergen_recall={:.3} overall_f1={:.3} sha256={}",
        trained.best.epoch, best_metrics.allergens.recall, best_metrics.overall.f1, entry.sha256
    );
    Ok(())
}

fn load_classifier(
    registry: &FsArtifactRegistry,
    runtime: RuntimeConfig,
    reference: &str,
    batch_size: usize,
    threshold: Option<Threshold>,
) -> Result<(RunDir, Classifier)> {
    let (run, artifact) = registry
        .load(reference)
        .with_context(|| format!("Failed to load artifact '{}'", reference))?;
    let mut builder = Classifier::builder()
        .with_runtime_config(runtime)
        .with_artifact(artifact)
        .with_batch_size(batch_size);
    if let Some(threshold) = threshold {
        builder = builder.with_threshold(threshold);
    }
    Ok((run, builder.build()?))
}

fn encode_dataset(classifier: &Classifier, path: &Path) -> Result<(EncodedDataset, DataSummary)> {
    let (rows, load) = read_rows(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let dataset = classifier.encode(&rows)?;
    let summary = DataSummary::new(load, dataset.summary);
    println!("Dataset rows: {}", summary);
    if dataset.is_empty() {
        bail!("Dataset {} is empty after preprocessing", path.display());
    }
    Ok((dataset, summary))
}

fn dataset_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string())
}

fn evaluate(registry: &FsArtifactRegistry, runtime: RuntimeConfig, args: EvaluateArgs) -> Result<()> {
    let threshold = match (args.threshold, &args.threshold_file) {
        (Some(value), _) => Some(Threshold::global(value)),
        (None, Some(path)) => {
            let report: TuningReport =
                read_json(path).with_context(|| format!("Failed to read tuning report {}", path.display()))?;
            let per_label = report
                .per_label_threshold_recall_priority
                .with_context(|| format!("{} has no per-label thresholds", path.display()))?;
            Some(per_label.threshold())
        }
        (None, None) => None,
    };

    let (run, classifier) = load_classifier(registry, runtime, &args.artifact.artifact, args.batch_size, threshold)?;
    let (dataset, data) = encode_dataset(&classifier, &args.dataset)?;
    let metrics = classifier.evaluate_dataset(&dataset)?;

    let out_path = run.file(&format!("eval-{}.json", dataset_stem(&args.dataset)));
    write_json(
        &out_path,
        &EvaluationReport {
            artifact_dir: &run.path,
            dataset: &args.dataset,
            rows: dataset.len(),
            threshold: classifier.threshold(),
            threshold_file: args.threshold_file.as_deref(),
            data,
            metrics: &metrics,
        },
    )?;

    println!(
        "rows={} overall_f1={:.3} allergen_recall={:.3} allergen_fn={}",
        dataset.len(),
        metrics.overall.f1,
        metrics.allergens.recall,
        metrics.allergen_false_negatives
    );
    println!("Saved evaluation report: {}", out_path.display());
    Ok(())
}

fn tune(registry: &FsArtifactRegistry, runtime: RuntimeConfig, args: TuneArgs) -> Result<()> {
    let (run, classifier) = load_classifier(registry, runtime, &args.artifact.artifact, args.batch_size, None)?;
    let (dataset, _) = encode_dataset(&classifier, &args.dataset)?;
    let logits = classifier.logits(&dataset)?;
    let targets = dataset.target_matrix();

    let tuner = ThresholdTuner::new(
        TunerConfig::default()
            .with_range(args.min_threshold, args.max_threshold)
            .with_steps(args.steps)
            .with_allergen_recall_target(args.allergen_recall_target)
            .with_diet_recall_target(args.diet_recall_target),
    );
    let mut report = tuner.tune(logits.view(), targets.view(), classifier.label_space(), args.per_label)?;
    report.dataset = Some(args.dataset.display().to_string());

    let out_path = run.file("threshold_tuning.json");
    write_json(&out_path, &report)?;

    let recall = &report.best_recall_priority;
    let f1 = &report.best_f1_priority;
    println!(
        "best_recall_priority threshold={:.3} allergen_recall={:.3} allergen_precision={:.3} overall_f1={:.3}",
        recall.threshold, recall.metrics.allergens.recall, recall.metrics.allergens.precision, recall.metrics.overall.f1
    );
    println!(
        "best_f1_priority threshold={:.3} allergen_recall={:.3} overall_f1={:.3}",
        f1.threshold, f1.metrics.allergens.recall, f1.metrics.overall.f1
    );
    if let Some(per_label) = &report.per_label_threshold_recall_priority {
        println!(
            "per_label allergen_recall={:.3} overall_f1={:.3}",
            per_label.metrics.allergens.recall, per_label.metrics.overall.f1
        );
    }
    println!("Saved threshold tuning report: {}", out_path.display());
    Ok(())
}

fn select(registry: &FsArtifactRegistry, runtime: RuntimeConfig, args: SelectArgs) -> Result<()> {
    let config = DistillConfig::default()
        .with_candidate_pool(args.candidate_pool)
        .with_max_examples(args.max_examples)
        .with_student_threshold(args.student_threshold);
    let (run, classifier) = load_classifier(registry, runtime, &args.artifact.artifact, args.batch_size, None)?;

    let (rows, load) = read_rows(&args.input).with_context(|| format!("Failed to read {}", args.input.display()))?;
    let already_distilled: HashSet<String> = match &args.exclude {
        Some(path) if path.exists() => {
            let (done, _) = read_rows(path).with_context(|| format!("Failed to read {}", path.display()))?;
            done.into_iter().map(|row| row.id).collect()
        }
        _ => HashSet::new(),
    };

    let candidates = build_candidates(&classifier, &rows, &config)?;
    let selection = select_candidates(candidates, &config, &already_distilled);
    write_jsonl(&args.output, &selection.selected)?;

    if let Some(path) = &args.summary_output {
        write_json(
            path,
            &SelectionSummary {
                input: &args.input,
                output: &args.output,
                artifact_dir: &run.path,
                load,
                candidate_rows: selection.candidate_rows,
                pool_size: selection.pool_size,
                selected: selection.selected.len(),
                skipped_existing: selection.skipped_existing,
                config: &config,
            },
        )?;
    }

    println!(
        "{} candidate_rows={} pool={} selected={} skipped_existing={}",
        load,
        selection.candidate_rows,
        selection.pool_size,
        selection.selected.len(),
        selection.skipped_existing
    );
    println!("Saved candidates: {}", args.output.display());
    Ok(())
}

fn intake(registry: &FsArtifactRegistry, args: IntakeArgs) -> Result<()> {
    let config = DistillConfig::default().with_min_teacher_confidence(args.min_teacher_confidence);
    let allowed = match &args.label_space_file {
        Some(path) => LabelSpace::from_file(path)
            .with_context(|| format!("Failed to read label space {}", path.display()))?,
        None => {
            let (_, artifact) = registry
                .load(&args.artifact.artifact)
                .with_context(|| format!("Failed to load artifact '{}'", args.artifact.artifact))?;
            artifact.label_space
        }
    };

    let (candidates, candidate_load) = read_jsonl::<Candidate>(&args.candidates)
        .with_context(|| format!("Failed to read {}", args.candidates.display()))?;
    let (outcomes, outcome_load) = read_jsonl::<TeacherLabel>(&args.outcomes)
        .with_context(|| format!("Failed to read {}", args.outcomes.display()))?;
    let existing: Vec<Row> = if args.resume && args.output.exists() {
        read_rows(&args.output)?.0
    } else {
        Vec::new()
    };

    let (rows, summary) = accept_teacher_labels(&candidates, &outcomes, existing, &allowed, &config);
    write_jsonl(&args.output, &rows)?;
    if let Some(path) = &args.summary_output {
        write_json(path, &summary)?;
    }

    println!("Candidates: {}", candidate_load);
    println!("Outcomes: {}", outcome_load);
    println!("{}", summary);
    println!("Saved distilled rows: {}", args.output.display());
    Ok(())
}
