//! Capacity and Load Weigher
//!
//! `score = capacity_weight * norm(usable_free) + load_weight * (1 - norm(load))`
//! with min-max normalization over the surviving candidates.

use crate::registry::Backend;
use serde::{Deserialize, Serialize};

/// Weight multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeigherConfig {
    pub capacity_weight: f64,
    pub load_weight: f64,
}

impl Default for WeigherConfig {
    fn default() -> Self {
        Self {
            capacity_weight: 1.0,
            load_weight: 0.5,
        }
    }
}

/// A surviving backend and its score
#[derive(Debug, Clone, PartialEq)]
pub struct WeighedBackend {
    pub name: String,
    pub score: f64,
    pub usable_free_gb: f64,
    pub load: u64,
}

/// Min-max normalization; all-equal inputs normalize to 0
fn normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|v| if span > 0.0 { (v - min) / span } else { 0.0 })
        .collect()
}

/// Score candidates and order them best first, ties by name
pub fn weigh(candidates: &[&Backend], config: &WeigherConfig) -> Vec<WeighedBackend> {
    let free: Vec<f64> = candidates
        .iter()
        .map(|b| b.report.as_ref().map(|r| r.usable_free_gb()).unwrap_or(0.0))
        .collect();
    let load: Vec<f64> = candidates.iter().map(|b| b.load() as f64).collect();

    let free_norm = normalize(&free);
    let load_norm = normalize(&load);

    let mut weighed: Vec<WeighedBackend> = candidates
        .iter()
        .enumerate()
        .map(|(i, b)| WeighedBackend {
            name: b.name.clone(),
            score: config.capacity_weight * free_norm[i]
                + config.load_weight * (1.0 - load_norm[i]),
            usable_free_gb: free[i],
            load: b.load(),
        })
        .collect();

    weighed.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    weighed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[10.0, 20.0, 30.0]), vec![0.0, 0.5, 1.0]);
        assert_eq!(normalize(&[5.0, 5.0]), vec![0.0, 0.0]);
        assert_eq!(normalize(&[7.0]), vec![0.0]);
    }
}
