//! Reading and writing the JSON and JSONL files the classifier works with.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::classifier::{ClassifierError, EncodeSummary, Row};

/// Line counts from one JSONL read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Non-blank lines seen
    pub lines: usize,
    pub decoded: usize,
    /// Lines that failed to decode and were skipped
    pub malformed: usize,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lines={} decoded={} malformed={}", self.lines, self.decoded, self.malformed)
    }
}

/// What happened to the rows of one input file, from disk to samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSummary {
    pub load: LoadSummary,
    pub encode: EncodeSummary,
}

impl DataSummary {
    pub fn new(load: LoadSummary, encode: EncodeSummary) -> Self {
        Self { load, encode }
    }

    /// Records dropped between the file and the encoded dataset.
    pub fn skipped(&self) -> usize {
        self.load.malformed + self.encode.skipped_empty_text
    }
}

impl fmt::Display for DataSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kept={} skipped={} (malformed={} empty_text={}) dropped_labels={}",
            self.encode.kept,
            self.skipped(),
            self.load.malformed,
            self.encode.skipped_empty_text,
            self.encode.dropped_labels
        )
    }
}

/// Reads a JSONL file of values of type `T`.
///
/// Blank lines are ignored. Lines that do not decode are logged and counted
/// rather than failing the read.
///
/// # Errors
/// - `InputMissing` if `path` does not exist
/// - `Io` if the file cannot be read
pub fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<(Vec<T>, LoadSummary), ClassifierError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ClassifierError::InputMissing(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::new();
    let mut summary = LoadSummary::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;
        match serde_json::from_str::<T>(line) {
            Ok(value) => {
                values.push(value);
                summary.decoded += 1;
            }
            Err(e) => {
                let err = ClassifierError::MalformedRecord {
                    line: index + 1,
                    reason: e.to_string(),
                };
                warn!("{}: {}", path.display(), err);
                summary.malformed += 1;
            }
        }
    }

    debug!("Read {}: {}", path.display(), summary);
    Ok((values, summary))
}

/// Reads and normalizes training rows.
pub fn read_rows(path: impl AsRef<Path>) -> Result<(Vec<Row>, LoadSummary), ClassifierError> {
    let (rows, summary) = read_jsonl::<Row>(path)?;
    Ok((rows.into_iter().map(Row::normalized).collect(), summary))
}

/// Reads a JSON document.
///
/// # Errors
/// - `InputMissing` if `path` does not exist
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ClassifierError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ClassifierError::InputMissing(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Writes `value` as pretty-printed JSON, creating parent directories.
pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<(), ClassifierError> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Writes one JSON value per line, replacing the file.
pub fn write_jsonl<'a, T, I>(path: impl AsRef<Path>, values: I) -> Result<usize, ClassifierError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    let mut written = 0;
    for value in values {
        serde_json::to_writer(&mut writer, value)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Appends one JSON value as a line.
pub fn append_jsonl<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), ClassifierError> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), ClassifierError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_rows_skips_blank_and_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(
            &path,
            "{\"id\":\" a \",\"text\":\"Peanut Butter\",\"allergens\":[\"peanut\",\"peanut\"]}\n\n{not json}\n{\"id\":\"b\",\"text\":null}\n",
        )
        .unwrap();

        let (rows, summary) = read_rows(&path).unwrap();
        assert_eq!(summary, LoadSummary { lines: 3, decoded: 2, malformed: 1 });
        assert_eq!(rows[0].id, "a");
        assert_eq!(rows[0].allergens, vec!["peanut"]);
        assert!(!rows[1].has_text());
    }

    #[test]
    fn test_missing_file_is_input_missing() {
        let dir = tempdir().unwrap();
        let result = read_rows(dir.path().join("absent.jsonl"));
        assert!(matches!(result, Err(ClassifierError::InputMissing(_))));
    }

    #[test]
    fn test_write_then_append_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let rows = vec![Row::new("1", "milk"), Row::new("2", "egg")];
        assert_eq!(write_jsonl(&path, &rows).unwrap(), 2);
        append_jsonl(&path, &Row::new("3", "soy")).unwrap();

        let (read, summary) = read_jsonl::<Row>(&path).unwrap();
        assert_eq!(summary.decoded, 3);
        assert_eq!(read[2].text, "soy");
    }

    #[test]
    fn test_data_summary_counts_skips() {
        let summary = DataSummary::new(
            LoadSummary { lines: 5, decoded: 4, malformed: 1 },
            EncodeSummary { rows: 4, kept: 3, skipped_empty_text: 1, dropped_labels: 2 },
        );
        assert_eq!(summary.skipped(), 2);
        assert!(summary.to_string().starts_with("kept=3 skipped=2"));
    }
}
