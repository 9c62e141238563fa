use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};

/// Index reserved for texts that yield no features at all.
pub const SENTINEL_FEATURE: u32 = 0;

const MIN_CHAR_NGRAM: usize = 3;
const MAX_CHAR_NGRAM: usize = 5;

/// Provides hashed text features for the sum-pooled model.
///
/// Feature extraction works in three steps:
/// 1. Tokenization into lowercase ASCII alphanumeric runs
/// 2. Generation of class-tagged feature strings: word unigrams (`w:`),
///    adjacent-token bigrams (`b:`) and boundary-padded character n-grams
///    of length 3 to 5 (`c:`) for tokens of at least three characters
/// 3. Hashing of every feature string into `[0, feature_dim)`
///
/// The class tags keep a word and an identical character n-gram from
/// landing on the same string before hashing. Collisions after hashing are
/// accepted: the index space is fixed regardless of corpus size.
pub trait TextFeatures {
    /// Size of the hashed index space
    fn feature_dim(&self) -> usize;

    /// Splits text into lowercase alphanumeric tokens.
    ///
    /// Anything outside `[a-z0-9]` after lowercasing acts as a separator,
    /// including non-ASCII letters.
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Returns the sorted, deduplicated hashed feature indices of `text`.
    ///
    /// Text without any tokens maps to `[SENTINEL_FEATURE]` so that every
    /// encoded sample owns at least one feature.
    fn extract(&self, text: &str) -> Vec<u32> {
        let tokens = self.tokenize(text);
        let features = feature_strings(&tokens);
        if features.is_empty() {
            return vec![SENTINEL_FEATURE];
        }

        let dim = self.feature_dim();
        let hashed: BTreeSet<u32> = features
            .iter()
            .map(|feature| hash_feature(feature, dim))
            .collect();
        hashed.into_iter().collect()
    }
}

/// Stateless feature hasher bound to a fixed index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureHasher {
    feature_dim: usize,
}

impl FeatureHasher {
    /// Creates a hasher. Dimensions below 2 are raised to 2.
    pub fn new(feature_dim: usize) -> Self {
        Self {
            feature_dim: feature_dim.max(2),
        }
    }
}

impl TextFeatures for FeatureHasher {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

fn feature_strings(tokens: &[String]) -> HashSet<String> {
    let mut features = HashSet::new();

    for token in tokens {
        features.insert(format!("w:{token}"));
    }

    for pair in tokens.windows(2) {
        features.insert(format!("b:{}_{}", pair[0], pair[1]));
    }

    for token in tokens.iter().filter(|token| token.len() >= MIN_CHAR_NGRAM) {
        // tokens are ASCII, so byte slicing is char slicing
        let padded = format!("^{token}$");
        let max_n = MAX_CHAR_NGRAM.min(padded.len());
        for n in MIN_CHAR_NGRAM..=max_n {
            for start in 0..=(padded.len() - n) {
                features.insert(format!("c:{}", &padded[start..start + n]));
            }
        }
    }

    features
}

/// Maps a feature string to an index using the first eight bytes of its
/// SHA-256 digest, read big-endian, modulo `feature_dim`.
pub fn hash_feature(feature: &str, feature_dim: usize) -> u32 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(prefix);
    (value % feature_dim.max(2) as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        let hasher = FeatureHasher::new(64);
        assert_eq!(
            hasher.tokenize("Whole MILK, Soy-Lecithin (E322)"),
            vec!["whole", "milk", "soy", "lecithin", "e322"]
        );
        assert!(hasher.tokenize("  ,;!  ").is_empty());
    }

    #[test]
    fn test_feature_strings_cover_all_classes() {
        let features = feature_strings(&["peanut".to_string(), "oil".to_string()]);
        assert!(features.contains("w:peanut"));
        assert!(features.contains("w:oil"));
        assert!(features.contains("b:peanut_oil"));
        assert!(features.contains("c:^pe"));
        assert!(features.contains("c:nut$"));
        assert!(features.contains("c:^pean"));
        assert!(features.contains("c:anut$"));
        assert!(features.contains("c:^oil"));
        // "^oil$" is five chars long, so it is its own 5-gram
        assert!(features.contains("c:^oil$"));
    }

    #[test]
    fn test_short_tokens_skip_char_ngrams() {
        let features = feature_strings(&["of".to_string()]);
        assert_eq!(features.len(), 1);
        assert!(features.contains("w:of"));
    }

    #[test]
    fn test_empty_text_yields_sentinel() {
        let hasher = FeatureHasher::new(512);
        assert_eq!(hasher.extract(""), vec![SENTINEL_FEATURE]);
        assert_eq!(hasher.extract("--- ** ---"), vec![SENTINEL_FEATURE]);
    }

    #[test]
    fn test_extract_is_sorted_and_unique() {
        let hasher = FeatureHasher::new(1 << 15);
        let indices = hasher.extract("sugar, wheat flour, sugar");
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn test_hash_feature_is_stable() {
        assert_eq!(hash_feature("w:milk", 1 << 15), hash_feature("w:milk", 1 << 15));
        assert!(hash_feature("w:milk", 2) < 2);
    }

    proptest! {
        #[test]
        fn prop_extract_deterministic_and_bounded(text in ".{0,80}", dim in 2usize..5000) {
            let hasher = FeatureHasher::new(dim);
            let first = hasher.extract(&text);
            let second = hasher.extract(&text);
            prop_assert_eq!(&first, &second);
            prop_assert!(!first.is_empty());
            prop_assert!(first.iter().all(|&index| (index as usize) < dim));
        }
    }
}
