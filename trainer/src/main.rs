use anyhow::{Context, Result};
use clap::{Parser, ValueEnum, ValueHint};
use resnet_replica::config::TrainConfig;
use resnet_replica::model::{ModelConfig, StridePlacement};
use resnet_replica::optim::OptimizerKind;
use resnet_replica::trainer::{ConsoleReporter, Trainer};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    /// ResNet-50 v1 (default).
    Resnet50,
    /// Two small stages, for smoke runs on small images.
    Tiny,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Data-parallel ResNet-50 training with per-device replicas"
)]
struct Cli {
    /// TOML file with training settings; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Number of replicas (one thread each)
    #[arg(long)]
    devices: Option<usize>,

    /// Images per replica per step
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    steps: Option<usize>,

    /// Steps between progress lines
    #[arg(long)]
    report_every: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// adagrad, momentum, sgd or adamw
    #[arg(long)]
    optimizer: Option<OptimizerKind>,

    /// Square input size in pixels
    #[arg(long)]
    image_size: Option<usize>,

    #[arg(long)]
    classes: Option<usize>,

    /// Feed workers per replica
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_hint = ValueHint::DirPath)]
    dataset_dir: Option<PathBuf>,

    /// Download the dataset if its `.success` sentinel is missing
    #[arg(long)]
    fetch_dataset: bool,

    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Put block strides on the leading 1x1 convolution instead of the 3x3
    #[arg(long)]
    stride_on_reduce: bool,
}

impl Cli {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TrainConfig::default(),
        };

        if let Some(preset) = self.preset {
            config.model = match preset {
                Preset::Resnet50 => ModelConfig::resnet50(),
                Preset::Tiny => ModelConfig::tiny(),
            };
        }
        if self.stride_on_reduce {
            config.model.stride_placement = StridePlacement::Reduce;
        }
        if let Some(devices) = self.devices {
            config.devices = devices;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
            config.prefetch = batch_size;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(report_every) = self.report_every {
            config.report_every = report_every;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(optimizer) = self.optimizer {
            config.optimizer = optimizer;
        }
        if let Some(size) = self.image_size {
            config.height = size;
            config.width = size;
        }
        if let Some(classes) = self.classes {
            config.classes = classes;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = self.dataset_dir {
            config.dataset_dir = dir;
        }
        config.fetch_dataset |= self.fetch_dataset;
        Ok(config)
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("installing tracing subscriber")
}

fn main() -> Result<()> {
    init_tracing()?;
    let config = Cli::parse().into_config()?;
    info!(
        devices = config.devices,
        batch_size = config.batch_size,
        steps = config.steps,
        optimizer = %config.optimizer,
        "starting"
    );

    let mut trainer = Trainer::<f32>::new(config, Box::new(ConsoleReporter::stdout()))
        .context("building replicas")?;
    let summary = trainer.run().context("training failed")?;
    info!(
        steps = summary.steps,
        images_per_sec = format_args!("{:.2}", summary.images_per_sec),
        "finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "train-resnet50",
            "--devices",
            "2",
            "--batch-size",
            "8",
            "--optimizer",
            "momentum",
            "--image-size",
            "32",
            "--preset",
            "tiny",
            "--stride-on-reduce",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.devices, 2);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.prefetch, 8);
        assert_eq!(config.optimizer, OptimizerKind::Momentum);
        assert_eq!((config.height, config.width), (32, 32));
        assert_eq!(config.model.stages, ModelConfig::tiny().stages);
        assert_eq!(config.model.stride_placement, StridePlacement::Reduce);
        assert_eq!(config.steps, 100_000);
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        assert!(Cli::try_parse_from(["train-resnet50", "--optimizer", "lbfgs"]).is_err());
    }
}
