use std::collections::{HashMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::ClassifierError;

/// Allergens recognised by the labeling pipeline, in canonical order.
pub const CANONICAL_ALLERGENS: [&str; 9] = [
    "milk",
    "egg",
    "peanut",
    "tree nut",
    "shellfish",
    "fish",
    "soy",
    "sesame",
    "wheat",
];

/// Which partition of the label space a label belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    Allergen,
    Diet,
}

/// Fixed, ordered label vocabulary: all allergens first, then all diets.
///
/// Output position `i` of the model is label `i` of this sequence. The
/// ordering is frozen into every artifact and must match exactly wherever
/// logits are decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    #[serde(default)]
    pub allergens: Vec<String>,
    #[serde(default)]
    pub diets: Vec<String>,
}

impl LabelSpace {
    /// Builds a label space, trimming entries and dropping blank ones.
    ///
    /// # Errors
    /// - `ValidationError` if a label appears twice anywhere in the space
    pub fn new<A, D>(allergens: A, diets: D) -> Result<Self, ClassifierError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let clean = |values: Vec<String>| -> Vec<String> {
            values
                .into_iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        };
        let allergens = clean(allergens.into_iter().map(|v| v.as_ref().to_string()).collect());
        let diets = clean(diets.into_iter().map(|v| v.as_ref().to_string()).collect());

        let mut seen = HashSet::new();
        for label in allergens.iter().chain(diets.iter()) {
            if !seen.insert(label.as_str()) {
                return Err(ClassifierError::ValidationError(format!(
                    "Duplicate label '{}' in label space",
                    label
                )));
            }
        }

        Ok(Self { allergens, diets })
    }

    /// Label space over the nine canonical allergens and the given diets.
    pub fn canonical_allergens<D>(diets: D) -> Result<Self, ClassifierError>
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self::new(CANONICAL_ALLERGENS, diets)
    }

    /// Reads a `{"allergens": [...], "diets": [...]}` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::InputMissing(path.to_path_buf()));
        }
        let raw: LabelSpace = serde_json::from_str(&fs::read_to_string(path)?)?;
        Self::new(raw.allergens, raw.diets)
    }

    pub fn output_dim(&self) -> usize {
        self.allergens.len() + self.diets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output_dim() == 0
    }

    pub fn allergen_count(&self) -> usize {
        self.allergens.len()
    }

    pub fn allergen_range(&self) -> Range<usize> {
        0..self.allergens.len()
    }

    pub fn diet_range(&self) -> Range<usize> {
        self.allergens.len()..self.output_dim()
    }

    /// Labels in output order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.allergens.iter().chain(self.diets.iter()).map(String::as_str)
    }

    pub fn label_at(&self, index: usize) -> Option<&str> {
        self.labels().nth(index)
    }

    pub fn kind_of(&self, index: usize) -> LabelKind {
        if index < self.allergens.len() {
            LabelKind::Allergen
        } else {
            LabelKind::Diet
        }
    }

    pub fn allergen_index(&self) -> HashMap<&str, usize> {
        self.allergens
            .iter()
            .enumerate()
            .map(|(index, label)| (label.as_str(), index))
            .collect()
    }

    pub fn diet_index(&self) -> HashMap<&str, usize> {
        let start = self.allergens.len();
        self.diets
            .iter()
            .enumerate()
            .map(|(index, label)| (label.as_str(), start + index))
            .collect()
    }

    /// Fails unless `other` has the identical ordering.
    pub fn ensure_matches(&self, other: &LabelSpace) -> Result<(), ClassifierError> {
        if self.output_dim() != other.output_dim() {
            return Err(ClassifierError::LabelSpaceMismatch {
                expected: self.output_dim(),
                actual: other.output_dim(),
            });
        }
        if self != other {
            return Err(ClassifierError::ValidationError(
                "Label space ordering differs from the artifact".into(),
            ));
        }
        Ok(())
    }
}
