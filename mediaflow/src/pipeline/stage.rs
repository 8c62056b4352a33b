//! Stage definitions and completion predicates.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::operation::PartialResult;

/// Ordered pipeline phase.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Structural extraction (frames, audio track, metadata).
    Fast,
    /// Medium-cost enrichment (captioning, object detection).
    Medium,
    /// Deep enrichment (transcription).
    Slow,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Fast, Stage::Medium, Stage::Slow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
        }
    }
}

/// Condition a stage's results must meet before the next stage may start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionPredicate {
    Always,
    /// Sum of this stage's result counts is at least `n`.
    MinTotal(u64),
    /// `operation` produced at least `min` results.
    MinCount { operation: String, min: u64 },
    /// `count(operation) >= count(relative_to) * min_ratio`,
    /// e.g. captions for at least 80% of the extracted frames.
    Ratio {
        operation: String,
        relative_to: String,
        min_ratio: f64,
    },
}

impl CompletionPredicate {
    /// `stage_total` is the sum of this stage's counts; `results` holds every
    /// result of the job so far. Missing operations count as zero.
    pub fn evaluate(
        &self,
        stage_total: u64,
        results: &BTreeMap<String, PartialResult>,
    ) -> std::result::Result<(), String> {
        let count = |op: &str| results.get(op).map(|r| r.count).unwrap_or(0);
        match self {
            Self::Always => Ok(()),
            Self::MinTotal(n) if stage_total >= *n => Ok(()),
            Self::MinTotal(n) => Err(format!("{stage_total} results, expected at least {n}")),
            Self::MinCount { operation, min } => {
                let got = count(operation);
                if got >= *min {
                    Ok(())
                } else {
                    Err(format!("{operation} produced {got}, expected at least {min}"))
                }
            }
            Self::Ratio {
                operation,
                relative_to,
                min_ratio,
            } => {
                let got = count(operation);
                let base = count(relative_to);
                let required = base as f64 * min_ratio;
                if got as f64 >= required {
                    Ok(())
                } else {
                    Err(format!(
                        "{operation} produced {got} for {base} {relative_to}, expected ratio {min_ratio}"
                    ))
                }
            }
        }
    }
}

/// Fixed configuration of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: Stage,
    /// Status label while the stage runs (`extracting`, ...).
    pub label: String,
    /// Latency budget; exceeding it is logged, not enforced.
    pub target_latency: Duration,
    /// Share of overall job progress, in percent.
    pub weight: u8,
    pub predicate: CompletionPredicate,
}

impl StageSpec {
    pub fn new(
        stage: Stage,
        label: impl Into<String>,
        target_latency: Duration,
        weight: u8,
    ) -> Self {
        Self {
            stage,
            label: label.into(),
            target_latency,
            weight,
            predicate: CompletionPredicate::Always,
        }
    }

    pub fn with_predicate(mut self, predicate: CompletionPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_target_latency(mut self, target_latency: Duration) -> Self {
        self.target_latency = target_latency;
        self
    }
}

/// Fast (20%) -> Medium (40%) -> Slow (40%).
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new(Stage::Fast, "extracting", Duration::from_secs(10), 20),
        StageSpec::new(Stage::Medium, "captioning", Duration::from_secs(60), 40),
        StageSpec::new(Stage::Slow, "transcribing", Duration::from_secs(300), 40),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, u64)]) -> BTreeMap<String, PartialResult> {
        pairs
            .iter()
            .map(|(op, count)| {
                (
                    op.to_string(),
                    PartialResult::new(*count, serde_json::Value::Null),
                )
            })
            .collect()
    }

    #[test]
    fn test_stage_order_and_names() {
        assert!(Stage::Fast < Stage::Medium && Stage::Medium < Stage::Slow);
        assert_eq!(Stage::Slow.to_string(), "slow");
        assert_eq!("medium".parse::<Stage>().unwrap(), Stage::Medium);
        let weights: u32 = default_stages().iter().map(|s| s.weight as u32).sum();
        assert_eq!(weights, 100);
    }

    #[test]
    fn test_ratio_predicate() {
        let predicate = CompletionPredicate::Ratio {
            operation: "caption".into(),
            relative_to: "frames".into(),
            min_ratio: 0.8,
        };
        assert!(predicate.evaluate(0, &results(&[("frames", 10), ("caption", 8)])).is_ok());
        let err = predicate
            .evaluate(0, &results(&[("frames", 10), ("caption", 7)]))
            .unwrap_err();
        assert!(err.contains("caption produced 7"));
        assert!(predicate.evaluate(0, &results(&[])).is_ok());
    }

    #[test]
    fn test_count_predicates() {
        let all = results(&[("frames", 3)]);
        assert!(CompletionPredicate::MinTotal(3).evaluate(3, &all).is_ok());
        assert!(CompletionPredicate::MinTotal(4).evaluate(3, &all).is_err());
        let min = CompletionPredicate::MinCount {
            operation: "audio".into(),
            min: 1,
        };
        assert!(min.evaluate(3, &all).is_err());
        assert!(CompletionPredicate::Always.evaluate(0, &all).is_ok());
    }
}
