//! Success scoring for analysis results.

use serde_json::Value;

const POSITIVE: &[&str] = &["good", "great", "excellent", "perfect"];
const NEGATIVE: &[&str] = &["bad", "wrong", "error", "failed"];

/// Score adjustment implied by free-text feedback.
///
/// Positive words win when both kinds appear.
pub fn feedback_adjustment(feedback: &str) -> f64 {
    let feedback = feedback.to_lowercase();
    if POSITIVE.iter().any(|w| feedback.contains(w)) {
        0.3
    } else if NEGATIVE.iter().any(|w| feedback.contains(w)) {
        -0.3
    } else {
        0.0
    }
}

/// Heuristic score: 0.5 base, +0.3 for a non-null result, +0.2 when it is a
/// non-empty array or object, then the feedback adjustment, clamped.
pub fn score_result(result: &Value, feedback: Option<&str>, min: f64, max: f64) -> f64 {
    let mut score = 0.5;
    if !result.is_null() {
        score += 0.3;
    }
    let non_empty = match result {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    };
    if non_empty {
        score += 0.2;
    }
    if let Some(feedback) = feedback {
        score += feedback_adjustment(feedback);
    }
    score.clamp(min, max)
}
