// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::solver::TaskState;

/// The result of scoring one sample against its target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Score {
    /// 1.0 = correct, 0.0 = incorrect; graded scorers use the range between.
    pub value: f64,
    /// The answer the scorer extracted from the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Score {
    pub fn correct(answer: impl Into<String>) -> Self {
        Self {
            value: 1.0,
            answer: Some(answer.into()),
            explanation: None,
        }
    }

    pub fn incorrect(answer: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            answer: Some(answer.into()),
            explanation: None,
        }
    }

    pub fn value(value: f64) -> Self {
        Self {
            value,
            answer: None,
            explanation: None,
        }
    }
}

/// Evaluates a final [`TaskState`] against the sample target.
///
/// Scorers are independent of each other; each configured scorer runs over
/// the same final state and its score is recorded separately.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, state: &TaskState, target: &str) -> anyhow::Result<Score>;
}

/// Scorer comparing model output text against the target.
///
/// In text mode the target must appear in the completion.  In numeric mode
/// numbers are extracted from the completion (commas stripped) and the
/// last one is compared against the target value — the standard scorer
/// for "ANSWER: 42"-style outputs.
pub struct MatchScorer {
    numeric: bool,
}

impl MatchScorer {
    pub fn new() -> Self {
        Self { numeric: false }
    }

    pub fn numeric() -> Self {
        Self { numeric: true }
    }
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchScorer {
    /// Score a bare completion string against a target; used directly by
    /// log re-scoring where no live task state exists.
    pub fn score_completion(&self, completion: &str, target: &str) -> anyhow::Result<Score> {
        if self.numeric {
            let target_value: f64 = target
                .trim()
                .replace(',', "")
                .parse()
                .map_err(|_| anyhow::anyhow!("numeric match target is not a number: {target}"))?;
            match extract_last_number(completion) {
                Some(found) if (found - target_value).abs() < f64::EPSILON => {
                    Ok(Score::correct(found.to_string()))
                }
                Some(found) => Ok(Score::incorrect(found.to_string())),
                None => Ok(Score::incorrect(completion)),
            }
        } else if completion.contains(target) {
            Ok(Score::correct(target))
        } else {
            Ok(Score::incorrect(completion))
        }
    }
}

#[async_trait]
impl Scorer for MatchScorer {
    fn name(&self) -> &str {
        "match"
    }

    async fn score(&self, state: &TaskState, target: &str) -> anyhow::Result<Score> {
        let completion = state
            .output
            .as_ref()
            .map(|o| o.completion())
            .unwrap_or_default();
        self.score_completion(&completion, target)
    }
}

fn extract_last_number(text: &str) -> Option<f64> {
    // commas inside numbers ("1,234.5") are thousands separators
    let cleaned = text.replace(',', "");
    let re = regex::Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex");
    re.find_iter(&cleaned)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

/// Mean of score values — the headline metric for a scorer.
pub fn accuracy<'a>(scores: impl IntoIterator<Item = &'a Score>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for score in scores {
        sum += score.value;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Reduce one sample's scores across epochs.
///
/// Supported reducers: `mean`, `median`, `mode`, `max`, and `at_least_<k>`
/// (1.0 when at least k epochs scored 1.0).  Returns `None` for an empty
/// score list or an unknown reducer name.
pub fn reduce_scores(reducer: &str, scores: &[Score]) -> Option<Score> {
    if scores.is_empty() {
        return None;
    }
    let values: Vec<f64> = scores.iter().map(|s| s.value).collect();
    let reduced = match reducer {
        "mean" => values.iter().sum::<f64>() / values.len() as f64,
        "median" => {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
        "mode" => {
            // most frequent value; ties break toward the larger value
            let mut best = (f64::NEG_INFINITY, 0usize);
            for candidate in &values {
                let count = values
                    .iter()
                    .filter(|v| (*v - candidate).abs() < f64::EPSILON)
                    .count();
                if count > best.1 || (count == best.1 && *candidate > best.0) {
                    best = (*candidate, count);
                }
            }
            best.0
        }
        "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        _ => {
            let k: usize = reducer.strip_prefix("at_least_")?.parse().ok()?;
            let passing = values.iter().filter(|v| **v >= 1.0).count();
            if passing >= k {
                1.0
            } else {
                0.0
            }
        }
    };
    Some(Score::value(reduced))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_numeric_compares_last_number() {
        let scorer = MatchScorer::numeric();
        assert_eq!(
            scorer.score_completion("ANSWER: 42", "42").unwrap().value,
            1.0
        );
        assert_eq!(
            scorer.score_completion("I think 41", "42").unwrap().value,
            0.0
        );
        assert_eq!(
            scorer.score_completion("no digits", "42").unwrap().value,
            0.0
        );
        assert!(scorer.score_completion("x", "not-a-number").is_err());
    }

    #[test]
    fn match_text_requires_target_substring() {
        let scorer = MatchScorer::new();
        assert_eq!(
            scorer
                .score_completion("the answer is Paris", "Paris")
                .unwrap()
                .value,
            1.0
        );
        assert_eq!(
            scorer
                .score_completion("the answer is London", "Paris")
                .unwrap()
                .value,
            0.0
        );
    }

    #[test]
    fn extract_last_number_handles_commas_and_signs() {
        assert_eq!(extract_last_number("ANSWER: 42"), Some(42.0));
        assert_eq!(extract_last_number("first 7 then 1,234.5"), Some(1234.5));
        assert_eq!(extract_last_number("delta is -3"), Some(-3.0));
        assert_eq!(extract_last_number("no numbers here"), None);
    }

    #[test]
    fn accuracy_is_mean_of_values() {
        let scores = [Score::value(1.0), Score::value(0.0), Score::value(0.5)];
        assert!((accuracy(&scores) - 0.5).abs() < 1e-9);
        assert_eq!(accuracy(&[]), 0.0);
    }

    #[test]
    fn reduce_mean_median_max() {
        let scores = [Score::value(0.0), Score::value(1.0), Score::value(1.0)];
        assert!((reduce_scores("mean", &scores).unwrap().value - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(reduce_scores("median", &scores).unwrap().value, 1.0);
        assert_eq!(reduce_scores("max", &scores).unwrap().value, 1.0);
    }

    #[test]
    fn reduce_mode_prefers_most_frequent() {
        let scores = [
            Score::value(0.0),
            Score::value(0.0),
            Score::value(1.0),
        ];
        assert_eq!(reduce_scores("mode", &scores).unwrap().value, 0.0);
    }

    #[test]
    fn reduce_at_least_k() {
        let scores = [Score::value(1.0), Score::value(0.0), Score::value(1.0)];
        assert_eq!(reduce_scores("at_least_2", &scores).unwrap().value, 1.0);
        assert_eq!(reduce_scores("at_least_3", &scores).unwrap().value, 0.0);
    }

    #[test]
    fn reduce_unknown_or_empty_is_none() {
        assert!(reduce_scores("mean", &[]).is_none());
        assert!(reduce_scores("bogus", &[Score::value(1.0)]).is_none());
    }
}
