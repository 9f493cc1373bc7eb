//! Default stage weight tables.
//!
//! Weights describe how much of the overall progress bar each stage is
//! worth. Known task kinds ship with tuned tables; anything else gets
//! uniform weights. Tables are normalized so weights sum to 1 over the
//! stages a task actually declares.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use taskpulse_shared::types::TaskKind;

static DOWNLOAD_WEIGHTS: Lazy<BTreeMap<&'static str, f64>> = Lazy::new(|| {
    BTreeMap::from([
        ("metadata", 0.05),
        ("downloading", 0.80),
        ("extracting", 0.10),
        ("finalizing", 0.05),
    ])
});

static TRANSCRIPTION_WEIGHTS: Lazy<BTreeMap<&'static str, f64>> = Lazy::new(|| {
    BTreeMap::from([
        ("preparing", 0.10),
        ("uploading", 0.20),
        ("processing", 0.60),
        ("downloading_result", 0.05),
        ("finalizing", 0.05),
    ])
});

/// Weight table for the given kind and declared stages, normalized to sum 1.
/// Stages absent from the kind's table fall back to a uniform share.
pub fn default_weights(kind: TaskKind, stages: &[String]) -> BTreeMap<String, f64> {
    let table: Option<&BTreeMap<&str, f64>> = match kind {
        TaskKind::Download => Some(&DOWNLOAD_WEIGHTS),
        TaskKind::Transcription => Some(&TRANSCRIPTION_WEIGHTS),
        TaskKind::Conversion | TaskKind::Upload => None,
    };

    let uniform = 1.0 / stages.len().max(1) as f64;
    let raw: BTreeMap<String, f64> = stages
        .iter()
        .map(|stage| {
            let weight = table
                .and_then(|t| t.get(stage.as_str()).copied())
                .unwrap_or(uniform);
            (stage.clone(), weight)
        })
        .collect();
    normalize(raw)
}

/// Scale a weight table so its values sum to 1. Zero or negative totals are
/// replaced with uniform weights.
pub fn normalize(weights: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        let uniform = 1.0 / weights.len().max(1) as f64;
        return weights.into_keys().map(|k| (k, uniform)).collect();
    }
    weights.into_iter().map(|(k, v)| (k, v / total)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_list(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_download_table_sums_to_one() {
        let stages = stage_list(&["metadata", "downloading", "extracting", "finalizing"]);
        let weights = default_weights(TaskKind::Download, &stages);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((weights["downloading"] - 0.80).abs() < 1e-9);
        assert!((weights["metadata"] - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_kind_gets_uniform_weights() {
        let stages = stage_list(&["a", "b", "c", "d"]);
        let weights = default_weights(TaskKind::Conversion, &stages);
        for w in weights.values() {
            assert!((w - 0.25).abs() < 1e-9);
        }
    }

    #[test]
    fn test_partial_table_coverage_normalizes() {
        // One known stage plus an unknown one: still sums to 1
        let stages = stage_list(&["downloading", "mystery"]);
        let weights = default_weights(TaskKind::Download, &stages);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(weights["downloading"] > weights["mystery"]);
    }

    #[test]
    fn test_normalize_rejects_zero_total() {
        let zeroed = BTreeMap::from([("a".to_string(), 0.0), ("b".to_string(), 0.0)]);
        let normalized = normalize(zeroed);
        assert!((normalized["a"] - 0.5).abs() < 1e-9);
        assert!((normalized["b"] - 0.5).abs() < 1e-9);
    }
}
