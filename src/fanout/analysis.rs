//! Post-aggregation analysis of a fan-out run.

use std::collections::BTreeMap;

use super::task::{ImageGenerationResult, ImageGenerationTask};
use crate::agents::outputs::ConsistencyReport;

/// Weights of the overall consistency score.
const CHARACTER_WEIGHT: f64 = 0.4;
const STYLE_WEIGHT: f64 = 0.35;
const VARIANCE_WEIGHT: f64 = 0.25;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64
}

/// Consistency score for one group of qualities: the average dampened by
/// how much the group varies, with the variance penalty capped at 0.3.
fn group_consistency(qualities: &[f64]) -> f64 {
    mean(qualities) * (1.0 - variance(qualities).min(0.3))
}

/// Character, style and quality-variance consistency across a run.
///
/// Tasks supply the character -> panel mapping; results supply the
/// per-panel qualities. Deterministic in its inputs.
pub fn consistency_report(
    tasks: &[ImageGenerationTask],
    results: &[ImageGenerationResult],
) -> ConsistencyReport {
    let quality_of: BTreeMap<&str, f64> = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.quality_score.map(|q| (r.panel_id.as_str(), q)))
        .collect();
    let all_qualities: Vec<f64> = quality_of.values().copied().collect();

    let mut per_character = BTreeMap::new();
    for task in tasks {
        for name in &task.characters {
            if let Some(quality) = quality_of.get(task.panel_id.as_str()) {
                per_character
                    .entry(name.clone())
                    .or_insert_with(Vec::new)
                    .push(*quality);
            }
        }
    }
    let per_character: BTreeMap<String, f64> = per_character
        .into_iter()
        .map(|(name, qualities)| (name, group_consistency(&qualities)))
        .collect();

    let character = if per_character.is_empty() {
        mean(&all_qualities)
    } else {
        mean(&per_character.values().copied().collect::<Vec<_>>())
    };
    let style = group_consistency(&all_qualities);
    let quality_variance = 1.0 - variance(&all_qualities).min(0.3);
    let overall =
        character * CHARACTER_WEIGHT + style * STYLE_WEIGHT + quality_variance * VARIANCE_WEIGHT;

    let mut recommendations = Vec::new();
    if character < 0.7 {
        recommendations.push("re-anchor character reference prompts across panels".to_string());
    }
    if style < 0.7 {
        recommendations.push("tighten shared style parameters between tasks".to_string());
    }
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        recommendations.push(format!("regenerate {} failed panel(s)", failed));
    }

    ConsistencyReport {
        character,
        style,
        quality_variance,
        overall,
        per_character,
        recommendations,
    }
}

/// Parallel efficiency of a run: how much the wall clock beat the serial
/// sum, adjusted down when the pool is small relative to the task count.
pub fn parallel_efficiency(durations_ms: &[u64], max_parallel: usize) -> f64 {
    if durations_ms.is_empty() {
        return 0.0;
    }
    let total: u64 = durations_ms.iter().sum();
    if total == 0 {
        // Every task was a cache hit; nothing ran serially either.
        return 1.0;
    }
    let longest = *durations_ms.iter().max().expect("non-empty") as f64;
    let raw = 1.0 - longest / total as f64;
    let adjustment =
        0.5 + 0.5 * (max_parallel as f64 / durations_ms.len() as f64).min(1.0);
    raw * adjustment
}

/// Fraction of tasks served from the cache.
pub fn cache_hit_rate(cache_hits: usize, total_tasks: usize) -> f64 {
    if total_tasks == 0 {
        0.0
    } else {
        cache_hits as f64 / total_tasks as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn task_with(panel_id: &str, characters: &[&str]) -> ImageGenerationTask {
        ImageGenerationTask {
            panel_id: panel_id.into(),
            prompt: panel_id.into(),
            negative_prompt: String::new(),
            style_parameters: BTreeMap::new(),
            characters: characters.iter().map(|c| c.to_string()).collect(),
            priority: 5,
            max_retries: 3,
        }
    }

    fn result_with(panel_id: &str, quality: f64) -> ImageGenerationResult {
        ImageGenerationResult {
            panel_id: panel_id.into(),
            success: true,
            quality_score: Some(quality),
            ..Default::default()
        }
    }

    #[test]
    fn uniform_quality_is_fully_consistent() {
        let tasks = vec![task_with("p1", &["Aya"]), task_with("p2", &["Aya"])];
        let results = vec![result_with("p1", 0.8), result_with("p2", 0.8)];
        let report = consistency_report(&tasks, &results);
        assert!((report.per_character["Aya"] - 0.8).abs() < 1e-9);
        assert!((report.quality_variance - 1.0).abs() < 1e-9);
        assert!(report.overall > 0.7);
    }

    #[test]
    fn variance_penalty_is_capped() {
        let tasks = vec![task_with("p1", &["Aya"]), task_with("p2", &["Aya"])];
        // Wildly divergent qualities: variance exceeds the 0.3 cap.
        let results = vec![result_with("p1", 0.1), result_with("p2", 0.9)];
        let report = consistency_report(&tasks, &results);
        let expected = 0.5 * (1.0 - 0.16_f64.min(0.3));
        assert!((report.per_character["Aya"] - expected).abs() < 1e-9);
    }

    #[test]
    fn failed_results_drive_recommendations() {
        let tasks = vec![task_with("p1", &[])];
        let results = vec![ImageGenerationResult {
            panel_id: "p1".into(),
            success: false,
            error_message: Some("boom".into()),
            ..Default::default()
        }];
        let report = consistency_report(&tasks, &results);
        assert!(
            report
                .recommendations
                .iter()
                .any(|r| r.contains("regenerate"))
        );
    }

    #[test]
    fn efficiency_rewards_balanced_parallel_runs() {
        // Four equal tasks with a pool of four: longest/total = 0.25.
        let score = parallel_efficiency(&[100, 100, 100, 100], 4);
        assert!((score - 0.75).abs() < 1e-9);

        // Same durations but a pool of one is adjusted down.
        let serial = parallel_efficiency(&[100, 100, 100, 100], 1);
        assert!(serial < score);
    }

    #[test]
    fn efficiency_edge_cases() {
        assert_eq!(parallel_efficiency(&[], 4), 0.0);
        // All cache hits: zero duration everywhere.
        assert_eq!(parallel_efficiency(&[0, 0], 4), 1.0);
        // A single task has no parallelism to exploit.
        assert_eq!(parallel_efficiency(&[500], 4), 0.0);
    }

    #[test]
    fn cache_hit_rate_bounds() {
        assert_eq!(cache_hit_rate(0, 0), 0.0);
        assert_eq!(cache_hit_rate(0, 8), 0.0);
        assert_eq!(cache_hit_rate(8, 8), 1.0);
        assert!((cache_hit_rate(3, 4) - 0.75).abs() < 1e-9);
    }
}
