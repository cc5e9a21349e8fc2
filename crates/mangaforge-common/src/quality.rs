//! Quality scores: weighted per-metric ratings with a letter grade.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed vocabulary of quality metrics used across the seven phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Relevance,
    GenreFit,
    Coherence,
    Creativity,
    CharacterConsistency,
    VisualAppeal,
    Technical,
    PlotConsistency,
    EmotionalImpact,
    Originality,
    LayoutQuality,
    CompositionQuality,
    ReadingFlow,
    CameraVariety,
    VisualHierarchy,
    PageComposition,
    ImageSuccessRate,
    AvgImageQuality,
    DialogueNaturalness,
    Readability,
    Composite,
}

/// One scored metric with its weight in the overall mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub score: f64,
    pub weight: f64,
}

/// Letter grade derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "D")]
    D,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A+")]
    APlus,
}

impl Grade {
    pub fn from_score(overall: f64) -> Self {
        if overall >= 0.9 {
            Grade::APlus
        } else if overall >= 0.85 {
            Grade::A
        } else if overall >= 0.8 {
            Grade::BPlus
        } else if overall >= 0.75 {
            Grade::B
        } else if overall >= 0.7 {
            Grade::CPlus
        } else if overall >= 0.65 {
            Grade::C
        } else if overall >= 0.6 {
            Grade::DPlus
        } else {
            Grade::D
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::DPlus => "D+",
            Grade::D => "D",
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighted-mean quality rating over a set of metrics.
///
/// Invariant: `overall == Σ(score·weight) / Σ(weight)` over `metrics`
/// (0 when the weight sum is 0). `computed_at` is the only wall-clock
/// dependence; everything else is a pure function of the inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: f64,
    pub metrics: BTreeMap<MetricKind, QualityMetric>,
    pub grade: Grade,
    pub computed_at: DateTime<Utc>,
}

impl QualityScore {
    pub fn from_metrics(metrics: BTreeMap<MetricKind, QualityMetric>) -> Self {
        let weight_sum: f64 = metrics.values().map(|m| m.weight).sum();
        let overall = if weight_sum > 0.0 {
            metrics.values().map(|m| m.score * m.weight).sum::<f64>() / weight_sum
        } else {
            0.0
        };
        Self {
            overall,
            grade: Grade::from_score(overall),
            metrics,
            computed_at: Utc::now(),
        }
    }

    /// Diff against an earlier score, used when a phase is re-run after
    /// rejected feedback.
    pub fn compare(&self, earlier: &QualityScore) -> ScoreComparison {
        let mut improved = Vec::new();
        let mut degraded = Vec::new();
        for (kind, metric) in &self.metrics {
            if let Some(prev) = earlier.metrics.get(kind) {
                if metric.score > prev.score + f64::EPSILON {
                    improved.push(*kind);
                } else if metric.score + f64::EPSILON < prev.score {
                    degraded.push(*kind);
                }
            }
        }
        ScoreComparison {
            delta: self.overall - earlier.overall,
            improved,
            degraded,
            grade_change: format!("{} -> {}", earlier.grade, self.grade),
        }
    }
}

/// Result of comparing two quality scores for the same phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComparison {
    pub delta: f64,
    pub improved: Vec<MetricKind>,
    pub degraded: Vec<MetricKind>,
    pub grade_change: String,
}
