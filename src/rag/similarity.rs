//! Lexical similarity for ranking knowledge-base entries.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when",
    "which", "who", "with",
];

/// Lower-cased alphanumeric tokens with stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Term-frequency vector of a text.
#[derive(Debug, Clone, Default)]
pub struct TermVector {
    counts: HashMap<String, f64>,
    norm: f64,
}

impl TermVector {
    pub fn new(text: &str) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_default() += 1.0;
        }
        let norm = counts.values().map(|c| c * c).sum::<f64>().sqrt();
        Self { counts, norm }
    }

    /// Cosine similarity in `[0, 1]`; zero when either side has no terms.
    pub fn cosine(&self, other: &TermVector) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.counts.len() <= other.counts.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .counts
            .iter()
            .filter_map(|(term, a)| large.counts.get(term).map(|b| a * b))
            .sum();
        dot / (self.norm * other.norm)
    }
}

/// Indices of the `top_k` items most similar to `query`, best first.
///
/// Ties keep the items' original order.
pub fn rank<T>(query: &str, items: &[T], text: impl Fn(&T) -> &str, top_k: usize) -> Vec<usize> {
    let query = TermVector::new(query);
    let mut scored: Vec<(usize, f64)> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (i, query.cosine(&TermVector::new(text(item)))))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().take(top_k).map(|(i, _)| i).collect()
}
