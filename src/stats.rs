//! Per-dataset normalization statistics.
//!
//! The model emits actions in [-1,1]; each training dataset stores the 1st
//! and 99th percentile of every action dimension, and `unnorm_key` picks the
//! table used to map outputs back to meters, radians and gripper commands.
//! The file layout follows `dataset_statistics.json` as written by the
//! training pipeline; fields other than the bounds are ignored.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StatsError;

const EPS: f32 = 1e-8;

/// Percentile bounds for one vector quantity (actions or proprio).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormBounds {
    pub q01: Vec<f32>,
    pub q99: Vec<f32>,
    /// Dimensions with `false` are passed through untouched (e.g. gripper).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<bool>>,
}

impl NormBounds {
    pub fn dim(&self) -> usize {
        self.q01.len()
    }

    fn masked(&self, i: usize) -> bool {
        self.mask
            .as_ref()
            .and_then(|m| m.get(i).copied())
            .unwrap_or(true)
    }

    fn validate(&self, key: &str, what: &str) -> Result<(), StatsError> {
        let malformed = |message: String| StatsError::Malformed {
            key: key.to_string(),
            message,
        };
        if self.q01.len() != self.q99.len() {
            return Err(malformed(format!(
                "{what}: q01 has {} entries, q99 has {}",
                self.q01.len(),
                self.q99.len()
            )));
        }
        if let Some(mask) = &self.mask {
            if mask.len() != self.q01.len() {
                return Err(malformed(format!(
                    "{what}: mask has {} entries, expected {}",
                    mask.len(),
                    self.q01.len()
                )));
            }
        }
        if let Some(i) = (0..self.dim()).find(|&i| self.q99[i] < self.q01[i]) {
            return Err(malformed(format!("{what}: q99 < q01 in dimension {i}")));
        }
        Ok(())
    }

    /// Maps values from [-1,1] back to dataset units.
    pub fn unnormalize(&self, values: &[f32]) -> Vec<f32> {
        values
            .iter()
            .enumerate()
            .map(|(i, &a)| match (self.q01.get(i), self.q99.get(i)) {
                (Some(&lo), Some(&hi)) if self.masked(i) => 0.5 * (a + 1.0) * (hi - lo + EPS) + lo,
                _ => a,
            })
            .collect()
    }

    /// Maps dataset values into [-1,1], clipping outliers.
    pub fn normalize(&self, values: &[f32]) -> Vec<f32> {
        values
            .iter()
            .enumerate()
            .map(|(i, &x)| match (self.q01.get(i), self.q99.get(i)) {
                (Some(&lo), Some(&hi)) if self.masked(i) => {
                    (2.0 * (x - lo) / (hi - lo + EPS) - 1.0).clamp(-1.0, 1.0)
                }
                _ => x,
            })
            .collect()
    }
}

/// Statistics recorded for one training dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub action: NormBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proprio: Option<NormBounds>,
}

/// All datasets known to a checkpoint, keyed by `unnorm_key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatisticsTable {
    datasets: HashMap<String, DatasetStatistics>,
}

impl StatisticsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, key: impl Into<String>, stats: DatasetStatistics) -> Self {
        self.datasets.insert(key.into(), stats);
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, StatsError> {
        let table: Self = serde_json::from_str(text)?;
        for (key, stats) in &table.datasets {
            stats.action.validate(key, "action")?;
            if let Some(proprio) = &stats.proprio {
                proprio.validate(key, "proprio")?;
            }
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StatsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Bounds for the LIBERO-Spatial fine-tune, used when no statistics file
    /// is configured.
    pub fn builtin() -> Self {
        Self::new().with_dataset(
            "libero_spatial_no_noops",
            DatasetStatistics {
                action: NormBounds {
                    q01: vec![-0.7454732, -0.66160715, -0.9375, -0.10714286, -0.20678571, -0.18428572, 0.0],
                    q99: vec![0.9375, 0.87589288, 0.93214285, 0.10392857, 0.17678571, 0.14571428, 1.0],
                    mask: Some(vec![true, true, true, true, true, true, false]),
                },
                proprio: None,
            },
        )
    }

    pub fn get(&self, key: &str) -> Result<&DatasetStatistics, StatsError> {
        self.datasets.get(key).ok_or_else(|| {
            let mut available: Vec<String> = self.datasets.keys().cloned().collect();
            available.sort();
            StatsError::UnknownKey {
                key: key.to_string(),
                available,
            }
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}
