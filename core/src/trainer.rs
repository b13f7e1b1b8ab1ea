//! Synchronous data-parallel training loop.
//!
//! Each replica runs on its own OS thread. A step is: pull a batch (blocking
//! on the feed), forward and backward, average gradients through the
//! collective, update locally. The collective blocks until every rank has
//! contributed, so replicas advance in lock step without any other barrier.
//!
//! One warmup step runs before the clock starts. Every `report_every` steps
//! each replica evaluates one extra batch, the losses are averaged across
//! ranks, and rank 0 reports progress.

use crate::aggregate::{self, AggregateError};
use crate::config::{ConfigError, TrainConfig};
use crate::data::{self, DataError};
use crate::distributed::{Collective, CommError, LocalCollective, RingCollective};
use crate::model::ModelError;
use crate::registry::RegistryError;
use crate::replica::Replica;
use crate::tensor::{TensorElem, TensorError};
use num_traits::Float;
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("Collective error: {0}")]
    Comm(#[from] CommError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("Cannot apply gradients: {0}")]
    Apply(String),
    #[error("Cannot write progress: {0}")]
    Report(#[from] io::Error),
    #[error("Replica {rank} panicked")]
    ReplicaPanicked { rank: usize },
    #[error("Trainer has no replicas; a previous run failed")]
    NoReplicas,
}

impl TrainError {
    /// Whether this error only reports that a peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TrainError::Comm(CommError::Disconnected { .. })
                | TrainError::Aggregate(AggregateError::Comm(CommError::Disconnected { .. }))
        )
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub step: usize,
    /// Images per step across all replicas.
    pub batch: usize,
    pub images_per_sec: f64,
    /// Cross-replica mean evaluation loss.
    pub loss: f64,
    /// Time since the previous report.
    pub during: Duration,
}

impl Progress {
    /// `elapsed` is measured from the end of warmup.
    pub fn new(step: usize, batch: usize, elapsed: Duration, during: Duration, loss: f64) -> Self {
        let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
        Self {
            step,
            batch,
            images_per_sec: (batch * step) as f64 / secs,
            loss,
            during,
        }
    }
}

/// `step = 100 (batch = 256; 812.34 images/sec): loss = 0.6931, during = 31.519s`
pub fn format_progress(p: &Progress) -> String {
    format!(
        "step = {} (batch = {}; {:.2} images/sec): loss = {:.4}, during = {:.3}s",
        p.step,
        p.batch,
        p.images_per_sec,
        p.loss,
        p.during.as_secs_f64()
    )
}

/// Sink for progress reports; only rank 0 reports.
pub trait Reporter: Send {
    fn report(&mut self, progress: &Progress) -> io::Result<()>;
}

/// Writes one formatted progress line per report.
pub struct ConsoleReporter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn report(&mut self, progress: &Progress) -> io::Result<()> {
        writeln!(self.out, "{}", format_progress(progress))?;
        self.out.flush()
    }
}

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub steps: usize,
    pub reports: usize,
    /// Last reported cross-replica loss.
    pub final_loss: Option<f64>,
    /// Wall time after warmup.
    pub elapsed: Duration,
    pub images_per_sec: f64,
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    steps: usize,
    report_every: usize,
    global_batch: usize,
}

struct Outcome {
    reports: usize,
    final_loss: Option<f64>,
    elapsed: Duration,
}

pub struct Trainer<T: TensorElem> {
    config: TrainConfig,
    replicas: Vec<Replica<T>>,
    reporter: Box<dyn Reporter>,
}

impl<T: TensorElem + Float + 'static> Trainer<T> {
    /// Validates `config`, optionally fetches the dataset, then builds one
    /// replica per device and checks that their parameters line up.
    pub fn new(mut config: TrainConfig, reporter: Box<dyn Reporter>) -> Result<Self> {
        config.validate()?;
        if config.fetch_dataset {
            data::ensure_dataset(&config.dataset_dir)?;
            let classes = data::class_count(&config.dataset_dir)?;
            if classes > 0 && classes != config.classes {
                warn!(
                    configured = config.classes,
                    found = classes,
                    "class count taken from dataset"
                );
                config.classes = classes;
            }
        }

        let collectives: Vec<Box<dyn Collective<T>>> = if config.devices == 1 {
            vec![Box::new(LocalCollective)]
        } else {
            RingCollective::<T>::ring(config.devices)?
                .into_iter()
                .map(|c| Box::new(c) as Box<dyn Collective<T>>)
                .collect()
        };
        let replicas = collectives
            .into_iter()
            .map(|collective| Replica::build(&config, collective))
            .collect::<Result<Vec<_>>>()?;

        let stores: Vec<_> = replicas.iter().map(|r| r.store()).collect();
        aggregate::check_store_alignment(&stores)?;
        if let Some(first) = replicas.first() {
            info!(
                devices = replicas.len(),
                params = first.store().len(),
                weights = first.store().num_elements(),
                optimizer = first.optimizer_name(),
                feed_bytes = config.feed_bytes(std::mem::size_of::<T>()),
                "replicas built"
            );
        }

        Ok(Self {
            config,
            replicas,
            reporter,
        })
    }

    /// Runs warmup and `config.steps` synchronised steps.
    ///
    /// On success the replicas are kept for inspection. If any replica
    /// fails, every replica is dropped (which unblocks its peers) and the
    /// first root-cause error is returned.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let replicas = std::mem::take(&mut self.replicas);
        if replicas.is_empty() {
            return Err(TrainError::NoReplicas);
        }
        let schedule = Schedule {
            steps: self.config.steps,
            report_every: self.config.report_every,
            global_batch: self.config.global_batch(),
        };
        let mut reporter = Some(self.reporter.as_mut());

        let joined: Vec<(usize, thread::Result<Result<(Replica<T>, Outcome)>>)> =
            thread::scope(|s| {
                let handles: Vec<_> = replicas
                    .into_iter()
                    .map(|mut replica| {
                        let rank = replica.rank();
                        let sink = if rank == 0 { reporter.take() } else { None };
                        let handle = s.spawn(move || {
                            let outcome = drive(&mut replica, schedule, sink);
                            if let Err(e) = &outcome {
                                if !e.is_disconnect() {
                                    error!(rank, "replica failed: {e}");
                                }
                            }
                            // Dropping the replica on failure disconnects its peers.
                            outcome.map(|o| (replica, o))
                        });
                        (rank, handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(rank, h)| (rank, h.join()))
                    .collect()
            });

        let mut finished = Vec::with_capacity(joined.len());
        let mut errors = Vec::new();
        for (rank, result) in joined {
            match result {
                Ok(Ok(done)) => finished.push(done),
                Ok(Err(e)) => errors.push(e),
                Err(_) => errors.push(TrainError::ReplicaPanicked { rank }),
            }
        }
        if !errors.is_empty() {
            let root = errors.iter().position(|e| !e.is_disconnect()).unwrap_or(0);
            return Err(errors.swap_remove(root));
        }

        let mut summary = None;
        for (replica, outcome) in finished {
            if replica.rank() == 0 {
                let secs = outcome.elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
                summary = Some(TrainSummary {
                    steps: schedule.steps,
                    reports: outcome.reports,
                    final_loss: outcome.final_loss,
                    elapsed: outcome.elapsed,
                    images_per_sec: (schedule.global_batch * schedule.steps) as f64 / secs,
                });
            }
            self.replicas.push(replica);
        }
        summary.ok_or(TrainError::NoReplicas)
    }
}

impl<T: TensorElem> Trainer<T> {
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Replicas ordered by rank; empty after a failed run.
    pub fn replicas(&self) -> &[Replica<T>] {
        &self.replicas
    }
}

fn drive<T: TensorElem + Float + 'static>(
    replica: &mut Replica<T>,
    schedule: Schedule,
    mut reporter: Option<&mut (dyn Reporter + 'static)>,
) -> Result<Outcome> {
    let lead = replica.rank() == 0;
    if lead {
        info!("Warmup Variables ..");
    }
    replica.step()?;
    if lead {
        info!("Launch Training ..");
    }

    let init = Instant::now();
    let mut last = init;
    let mut reports = 0;
    let mut final_loss = None;
    for k in 0..schedule.steps {
        replica.step()?;
        let step = k + 1;
        if step % schedule.report_every != 0 {
            continue;
        }
        let curr = Instant::now();
        let loss = replica.mean_loss()?.to_f64().unwrap_or(f64::NAN);
        if let Some(sink) = reporter.as_deref_mut() {
            let progress = Progress::new(
                step,
                schedule.global_batch,
                curr - init,
                curr - last,
                loss,
            );
            sink.report(&progress)?;
            last = Instant::now();
        }
        reports += 1;
        final_loss = Some(loss);
    }
    Ok(Outcome {
        reports,
        final_loss,
        elapsed: init.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_progress() {
        let p = Progress::new(
            100,
            256,
            Duration::from_secs(32),
            Duration::from_millis(31_519),
            0.693_147,
        );
        assert_eq!(p.images_per_sec, 800.0);
        assert_eq!(
            format_progress(&p),
            "step = 100 (batch = 256; 800.00 images/sec): loss = 0.6931, during = 31.519s"
        );
    }

    #[test]
    fn test_console_reporter_writes_lines() {
        let mut reporter = ConsoleReporter::new(Vec::new());
        let p = Progress::new(2, 8, Duration::from_secs(1), Duration::from_secs(1), 1.0);
        reporter.report(&p).unwrap();
        reporter.report(&p).unwrap();
        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("step = 2 (batch = 8; 16.00 images/sec)"));
    }

    #[test]
    fn test_disconnect_classification() {
        let wrapped = TrainError::Aggregate(AggregateError::Comm(CommError::Disconnected { rank: 1 }));
        assert!(wrapped.is_disconnect());
        assert!(!TrainError::Apply("x".into()).is_disconnect());
    }
}
