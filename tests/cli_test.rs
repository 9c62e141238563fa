use std::fs;
use std::process::Command;

use tempfile::tempdir;

const TRAIN_JSONL: &str = r#"{"id": "p1", "text": "peanut butter cookies", "allergens": ["peanut"]}
{"id": "v1", "text": "lentil tomato soup", "diets": ["Vegan"]}
"#;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_allergen_cli"))
}

#[test]
fn test_train_without_label_space_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let train_file = dir.path().join("train.jsonl");
    fs::write(&train_file, TRAIN_JSONL)?;
    let artifacts = dir.path().join("artifacts");

    let output = cli()
        .current_dir(dir.path())
        .arg("--artifact-root")
        .arg(&artifacts)
        .arg("train")
        .arg("--train-file")
        .arg(&train_file)
        .arg("--label-space-file")
        .arg(dir.path().join("label_space.json"))
        .arg("--epochs")
        .arg("1")
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Input missing"), "unexpected stderr: {stderr}");
    assert!(!artifacts.join("index.json").exists());
    Ok(())
}

#[test]
fn test_train_default_label_space_path_is_required() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let train_file = dir.path().join("train.jsonl");
    fs::write(&train_file, TRAIN_JSONL)?;

    // no label space under the working directory's default location
    let output = cli()
        .current_dir(dir.path())
        .arg("--artifact-root")
        .arg(dir.path().join("artifacts"))
        .arg("train")
        .arg("--train-file")
        .arg(&train_file)
        .output()?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("label_space.json"));
    Ok(())
}

#[test]
fn test_train_with_label_space_commits_run() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let train_file = dir.path().join("train.jsonl");
    fs::write(&train_file, TRAIN_JSONL)?;
    let label_space = dir.path().join("label_space.json");
    fs::write(&label_space, r#"{"allergens": ["peanut", "milk"], "diets": ["Vegan"]}"#)?;
    let artifacts = dir.path().join("artifacts");

    let output = cli()
        .arg("--artifact-root")
        .arg(&artifacts)
        .arg("train")
        .arg("--train-file")
        .arg(&train_file)
        .arg("--label-space-file")
        .arg(&label_space)
        .arg("--feature-dim")
        .arg("256")
        .arg("--epochs")
        .arg("2")
        .output()?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(artifacts.join("index.json").exists());
    Ok(())
}
