//! One model replica per device.
//!
//! A replica is rooted at scope `gpu_<rank>` and owns everything it touches
//! during a step: its parameter store, the model built into it, its optimizer
//! state, its input feed and its end of the collective. Only the averaged
//! gradients cross replica boundaries, through the collective.

use crate::aggregate::{self, AveragedGradients, GradientBundle};
use crate::config::TrainConfig;
use crate::data::{
    self, Batch, BatchSource, DataError, ImageFolder, Prefetcher, SyntheticImages,
};
use crate::distributed::Collective;
use crate::model::ResNet;
use crate::optim::{build_optimizer, Optimizer};
use crate::registry::{ParamStore, Scope};
use crate::tensor::TensorElem;
use crate::trainer::{Result, TrainError};
use num_traits::Float;
use tracing::debug;

pub struct Replica<T: TensorElem> {
    rank: usize,
    scope: Scope,
    store: ParamStore<T>,
    model: ResNet,
    optimizer: Box<dyn Optimizer<T>>,
    feed: Prefetcher<T>,
    collective: Box<dyn Collective<T>>,
}

/// Seed of feed worker `worker` on device `rank`; every worker draws its own stream.
fn feed_seed(seed: u64, rank: usize, worker: usize) -> u64 {
    seed.wrapping_add(1)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(((rank as u64) << 32) | worker as u64)
}

/// One source per feed worker: the images under `<dataset_dir>/train` when
/// the dataset is fetched, synthetic images otherwise.
fn feed_sources<T: TensorElem + 'static>(
    config: &TrainConfig,
    rank: usize,
) -> data::Result<Vec<Box<dyn BatchSource<T>>>> {
    let seeds = (0..config.workers).map(|w| feed_seed(config.seed, rank, w));
    if !config.fetch_dataset {
        return Ok(seeds
            .map(|seed| {
                Box::new(SyntheticImages::new(
                    config.batch_size,
                    config.image_shape(),
                    config.classes,
                    seed,
                )) as Box<dyn BatchSource<T>>
            })
            .collect());
    }

    let train = config.dataset_dir.join(data::TRAIN_DIR);
    let folder = ImageFolder::open(&train, config.batch_size, config.image_shape(), 0)?;
    if folder.classes() != config.classes {
        return Err(DataError::Layout(format!(
            "{} holds {} classes, configured for {}",
            train.display(),
            folder.classes(),
            config.classes
        )));
    }
    Ok(seeds
        .map(|seed| Box::new(folder.with_seed(seed)) as Box<dyn BatchSource<T>>)
        .collect())
}

impl<T: TensorElem + Float + 'static> Replica<T> {
    /// Builds the replica for `collective.rank()`.
    ///
    /// Every replica's store is seeded with `config.seed`, so replicas built
    /// from the same configuration start with identical weights.
    pub fn build(config: &TrainConfig, collective: Box<dyn Collective<T>>) -> Result<Self> {
        let rank = collective.rank();
        let scope = Scope::device(rank);
        let mut store = ParamStore::new(scope.id(), config.seed);
        let model = ResNet::new(
            &mut store,
            &scope,
            &config.model,
            config.image_shape(),
            config.classes,
        )?;

        let sources = feed_sources(config, rank)?;
        let feed = Prefetcher::spawn(&scope.path(), sources, config.prefetch)?;
        let optimizer = build_optimizer(config.optimizer, config.learning_rate, config.momentum)?;

        debug!(
            scope = %scope.path(),
            optimizer = optimizer.name(),
            workers = feed.workers(),
            "replica ready"
        );
        Ok(Self {
            rank,
            scope,
            store,
            model,
            optimizer,
            feed,
            collective,
        })
    }

    /// Loss and gradients of one batch, restricted to this replica's parameters.
    pub fn compute_gradients(&self, batch: Batch<T>) -> Result<(T, GradientBundle<T>)> {
        let (loss, trace) = self.model.forward(&self.store, batch.images, &batch.labels)?;
        let bundle = self.model.backward(&self.store, &trace)?;
        bundle.check_owned_by(&self.store)?;
        Ok((loss, bundle))
    }

    /// Averages `bundle` with every other replica. Blocks until all ranks arrive.
    pub fn synchronize(&self, bundle: GradientBundle<T>) -> Result<AveragedGradients<T>> {
        Ok(aggregate::all_reduce_average(bundle, self.collective.as_ref())?)
    }

    /// Applies averaged gradients to this replica's own parameters.
    pub fn apply(&mut self, averaged: &AveragedGradients<T>) -> Result<()> {
        if averaged.len() != self.store.len() {
            return Err(TrainError::Apply(format!(
                "{}: {} averaged gradients for {} parameters",
                self.scope.path(),
                averaged.len(),
                self.store.len()
            )));
        }
        for id in self.store.ids() {
            let name = &self.store.get(id)?.name;
            let grad = averaged
                .get(id.slot)
                .filter(|g| &g.name == name)
                .ok_or_else(|| {
                    TrainError::Apply(format!("no averaged gradient for {} ({name})", id))
                })?;
            let param = self.store.value_mut(id)?;
            self.optimizer
                .update(id.slot, param.data_mut(), grad.grad.data())?;
        }
        Ok(())
    }

    /// Pulls a batch, computes gradients, averages them across replicas and
    /// updates. Returns this replica's loss on the batch.
    pub fn step(&mut self) -> Result<T> {
        let batch = self.feed.next()?;
        let (loss, bundle) = self.compute_gradients(batch)?;
        let averaged = self.synchronize(bundle)?;
        self.apply(&averaged)?;
        Ok(loss)
    }

    /// Loss on the next batch, without updating.
    pub fn evaluate(&self) -> Result<T> {
        let batch = self.feed.next()?;
        Ok(self
            .model
            .evaluate(&self.store, &batch.images, &batch.labels)?)
    }

    /// Mean evaluation loss over all replicas (`sum / N`).
    pub fn mean_loss(&self) -> Result<T> {
        let local = self.evaluate()?;
        Ok(aggregate::all_reduce_mean(local, self.collective.as_ref())?)
    }
}

impl<T: TensorElem> Replica<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn store(&self) -> &ParamStore<T> {
        &self.store
    }

    pub fn model(&self) -> &ResNet {
        &self.model
    }

    pub fn optimizer_name(&self) -> &'static str {
        self.optimizer.name()
    }
}
