use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// The 28x28 grayscale images flattened into a single column.
pub const IMAGE_PIXELS: usize = 28 * 28;
// Number of clothing classes in the dataset.
pub const CLASSES: usize = 10;

// How each epoch's training set is cut into minibatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BatchMethod {
    // Shuffle, then emit the complete batches followed by the short remainder.
    Basic,
    // Shuffle, then chunk the permutation; same partition as `Basic`.
    Experimental,
    // Producer threads feed a bounded queue that the training loop drains.
    #[serde(rename = "tensorflow")]
    #[value(name = "tensorflow", alias = "queue")]
    Queue,
}

// Widths of the four fully-connected layers. `l4` is the output layer and
// has to match the number of label classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSizes {
    #[serde(rename = "L1")]
    pub l1: usize,
    #[serde(rename = "L2")]
    pub l2: usize,
    #[serde(rename = "L3")]
    pub l3: usize,
    #[serde(rename = "L4")]
    pub l4: usize,
}

impl Default for LayerSizes {
    fn default() -> Self {
        Self {
            l1: 50,
            l2: 25,
            l3: 12,
            l4: CLASSES,
        }
    }
}

impl LayerSizes {
    pub fn as_array(&self) -> [usize; 4] {
        [self.l1, self.l2, self.l3, self.l4]
    }

    // `(rows, columns)` of every weight matrix given the input width.
    pub fn weight_shapes(&self, input: usize) -> [(usize, usize); 4] {
        let [l1, l2, l3, l4] = self.as_array();
        [(l1, input), (l2, l1), (l3, l2), (l4, l3)]
    }
}

// Hyperparameters of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_method: BatchMethod,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub keep_prob: f32,
    #[serde(rename = "epoch")]
    pub epochs: usize,
    pub thread_count: usize,
    pub queue_capacity: usize,
    #[serde(flatten)]
    pub layers: LayerSizes,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_method: BatchMethod::Experimental,
            learning_rate: 0.001,
            batch_size: 32,
            keep_prob: 0.8,
            epochs: 1500,
            thread_count: 2,
            queue_capacity: 100,
            layers: LayerSizes::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_string()));
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }

        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "keep_prob must be in (0, 1], got {}",
                self.keep_prob
            )));
        }

        if self.batch_method == BatchMethod::Queue {
            if self.thread_count == 0 {
                return Err(Error::InvalidConfig(
                    "thread_count must be > 0 for the queue batch method".to_string(),
                ));
            }
            if self.queue_capacity == 0 {
                return Err(Error::InvalidConfig(
                    "queue_capacity must be > 0 for the queue batch method".to_string(),
                ));
            }
        }

        if let Some(layer) = self.layers.as_array().iter().position(|&size| size == 0) {
            return Err(Error::InvalidConfig(format!(
                "layer L{} must have at least one unit",
                layer + 1
            )));
        }

        Ok(())
    }
}

// A timestamped, write-only record of the hyperparameters a run used.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot<'a> {
    pub timestamp: String,
    #[serde(flatten)]
    pub config: &'a TrainingConfig,
}

impl<'a> ConfigSnapshot<'a> {
    pub fn new(config: &'a TrainingConfig, taken_at: DateTime<Local>) -> Self {
        Self {
            timestamp: taken_at.to_rfc3339(),
            config,
        }
    }

    // Writes `config_<timestamp>.json` into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path, taken_at: DateTime<Local>) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "config_{}.json",
            taken_at.format("%Y-%m-%d_%H-%M-%S")
        ));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn queue_settings_only_checked_for_queue_method() {
        let mut config = TrainingConfig {
            thread_count: 0,
            ..TrainingConfig::default()
        };
        config.validate().unwrap();

        config.batch_method = BatchMethod::Queue;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_keep_prob_outside_unit_interval() {
        for keep_prob in [0.0, -0.5, 1.5, f32::NAN] {
            let config = TrainingConfig {
                keep_prob,
                ..TrainingConfig::default()
            };
            assert!(config.validate().is_err(), "keep_prob {keep_prob} accepted");
        }
    }

    #[test]
    fn snapshot_uses_flat_keys() {
        let config = TrainingConfig {
            batch_method: BatchMethod::Queue,
            ..TrainingConfig::default()
        };
        let snapshot = ConfigSnapshot::new(&config, Local::now());
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["batch_method"], "tensorflow");
        assert_eq!(value["epoch"], 1500);
        assert_eq!(value["L1"], 50);
        assert_eq!(value["L4"], 10);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn snapshot_is_written_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::default();
        let now = Local::now();
        let path = ConfigSnapshot::new(&config, now)
            .write_to(&dir.path().join("hyperparameters"), now)
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["batch_size"], 32);
        assert_eq!(written["batch_method"], "experimental");
    }
}
