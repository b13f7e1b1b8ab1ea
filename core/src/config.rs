//! Training configuration.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! devices = 2
//! batch_size = 16
//! optimizer = "momentum"
//!
//! [model]
//! stride_placement = "reduce"
//! ```

use crate::model::ModelConfig;
use crate::optim::OptimizerKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Number of replicas, one per device thread.
    pub devices: usize,
    /// Images per replica per step.
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub classes: usize,
    pub steps: usize,
    /// Steps between progress lines.
    pub report_every: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    /// Only read by the momentum optimizer.
    pub momentum: f64,
    /// Queued batches per device. Defaults to `batch_size`; at the default
    /// 64 x 3 x 224 x 224 f32 batches that is about 2.5 GB per device, so
    /// lower it on small hosts (see [`TrainConfig::feed_bytes`]).
    pub prefetch: usize,
    /// Feed workers per device.
    pub workers: usize,
    pub seed: u64,
    pub dataset_dir: PathBuf,
    /// Download the dataset into `dataset_dir` before training if its
    /// sentinel is missing.
    pub fetch_dataset: bool,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let batch_size = 64;
        Self {
            devices: 4,
            batch_size,
            channels: 3,
            height: 224,
            width: 224,
            classes: 2,
            steps: 100_000,
            report_every: 100,
            learning_rate: 0.01,
            optimizer: OptimizerKind::Adagrad,
            momentum: 0.9,
            prefetch: batch_size,
            workers: 8,
            seed: 0,
            dataset_dir: PathBuf::from("/tmp/dataset/catsdogs"),
            fetch_dataset: false,
            model: ModelConfig::resnet50(),
        }
    }
}

impl TrainConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// `[channels, height, width]` of one image.
    pub fn image_shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    /// Images consumed per step across all replicas.
    pub fn global_batch(&self) -> usize {
        self.batch_size * self.devices
    }

    /// Pixel bytes held by one device's full prefetch queue.
    pub fn feed_bytes(&self, elem_size: usize) -> usize {
        self.prefetch * self.batch_size * self.channels * self.height * self.width * elem_size
    }

    /// Rejects values the trainer cannot run with. Layer shapes are checked
    /// separately when the model is planned.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("devices", self.devices),
            ("batch_size", self.batch_size),
            ("channels", self.channels),
            ("height", self.height),
            ("width", self.width),
            ("classes", self.classes),
            ("steps", self.steps),
            ("report_every", self.report_every),
            ("prefetch", self.prefetch),
            ("workers", self.workers),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::Invalid(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StridePlacement;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TrainConfig::default();
        assert_eq!(config.devices, 4);
        assert_eq!(config.prefetch, config.batch_size);
        assert_eq!(config.optimizer, OptimizerKind::Adagrad);
        assert_eq!(config.global_batch(), 256);
        assert_eq!(config.image_shape(), [3, 224, 224]);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_feed_footprint() {
        let config = TrainConfig::default();
        assert_eq!(config.feed_bytes(4), 2_466_250_752);
        let small = TrainConfig {
            prefetch: 4,
            ..TrainConfig::default()
        };
        assert_eq!(small.feed_bytes(4) * 16, config.feed_bytes(4));
    }

    #[test]
    fn test_partial_toml() {
        let config = TrainConfig::from_toml_str(
            r#"
            devices = 2
            optimizer = "momentum"

            [model]
            stride_placement = "reduce"
            "#,
        )
        .unwrap();
        assert_eq!(config.devices, 2);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.optimizer, OptimizerKind::Momentum);
        assert_eq!(config.model.stride_placement, StridePlacement::Reduce);
        assert_eq!(config.model.stages.len(), 4);
    }

    #[test]
    fn test_from_file_and_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "steps = 7").unwrap();
        assert_eq!(TrainConfig::from_toml_file(file.path()).unwrap().steps, 7);

        assert!(matches!(
            TrainConfig::from_toml_file(Path::new("/nonexistent/train.toml")),
            Err(ConfigError::Io { .. })
        ));
        assert!(matches!(
            TrainConfig::from_toml_str("devices = \"four\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = TrainConfig {
            devices: 0,
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
        config.devices = 1;
        config.learning_rate = 0.0;
        assert!(config.validate().is_err());
        config.learning_rate = 0.1;
        config.report_every = 0;
        assert!(config.validate().is_err());
    }
}
