use super::block::{Bottleneck, BottleneckTrace};
use super::config::{ModelConfig, ShapePlan};
use super::{ModelError, Result};
use crate::aggregate::GradientBundle;
use crate::loss::softmax_cross_entropy;
use crate::nn::{flatten, relu, relu_backward, unflatten, AvgPool2d, Conv2d, Dense, Gradients, MaxPool2d};
use crate::registry::{ParamStore, Scope};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use tracing::{debug, info};

/// ResNet-50 v1 classifier whose weights live in one device's [`ParamStore`].
///
/// Stem convolution -> ReLU -> max pool, the bottleneck stages, a global
/// average pool over the remaining spatial extent, flatten and a dense layer
/// to class logits. Training uses mean softmax cross-entropy.
#[derive(Debug, Clone)]
pub struct ResNet {
    plan: ShapePlan,
    stem: Conv2d,
    stem_pool: MaxPool2d,
    blocks: Vec<Bottleneck>,
    head_pool: AvgPool2d,
    logits: Dense,
}

/// Everything the backward pass needs from one forward pass.
#[derive(Debug, Clone)]
pub struct Trace<T: TensorElem> {
    images: Tensor<T, 4>,
    /// Stem convolution output after ReLU.
    stem: Tensor<T, 4>,
    /// Stem pool output followed by every block output.
    activations: Vec<Tensor<T, 4>>,
    blocks: Vec<BottleneckTrace<T>>,
    head_shape: [usize; 4],
    features: Tensor<T, 2>,
    grad_logits: Tensor<T, 2>,
    loss: T,
}

impl<T: TensorElem> Trace<T> {
    pub fn loss(&self) -> T {
        self.loss
    }

    pub fn batch_size(&self) -> usize {
        self.images.shape()[0]
    }
}

impl ResNet {
    /// Resolves `config` for `[channels, height, width]` images and allocates
    /// every weight under `scope`.
    pub fn new<T: TensorElem>(
        store: &mut ParamStore<T>,
        scope: &Scope,
        config: &ModelConfig,
        input: [usize; 3],
        classes: usize,
    ) -> Result<Self> {
        info!("Creating imagenet_resnet50v1 on scope `{}`..", scope.path());
        let plan = config.plan(input, classes)?;

        let stem = Conv2d::new(store, &scope.child("conv1"), input[0], config.stem.conv)?;
        let stem_pool = MaxPool2d::new(config.stem.pool_kernel, config.stem.pool_stride);
        let blocks = plan
            .blocks
            .iter()
            .map(|block| Bottleneck::new(store, scope, block))
            .collect::<Result<Vec<_>>>()?;
        let head_pool = AvgPool2d::new(plan.final_hw[0], 1);
        let logits = Dense::new(store, &scope.child("logits"), plan.features, classes)?;

        debug!(
            scope = %scope.path(),
            params = store.len(),
            weights = store.num_elements(),
            "model built"
        );
        Ok(Self {
            plan,
            stem,
            stem_pool,
            blocks,
            head_pool,
            logits,
        })
    }

    pub fn plan(&self) -> &ShapePlan {
        &self.plan
    }

    pub fn blocks(&self) -> &[Bottleneck] {
        &self.blocks
    }

    fn check_inputs<T: TensorElem>(&self, images: &Tensor<T, 4>, labels: &Tensor<T, 2>) -> Result<()> {
        let [batch, c, h, w] = *images.shape();
        let [ec, eh, ew] = self.plan.input;
        if batch == 0 || [c, h, w] != self.plan.input {
            return Err(ModelError::InputShape {
                expected: vec![batch.max(1), ec, eh, ew],
                got: images.shape().to_vec(),
            });
        }
        if *labels.shape() != [batch, self.plan.classes] {
            return Err(ModelError::InputShape {
                expected: vec![batch, self.plan.classes],
                got: labels.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Class logits for a batch, keeping no intermediate activations.
    pub fn logits<T: TensorElem>(&self, store: &ParamStore<T>, images: &Tensor<T, 4>) -> Result<Tensor<T, 2>> {
        let stem = relu(&self.stem.forward(store, images)?);
        let mut x = self.stem_pool.forward(&stem)?;
        for block in &self.blocks {
            x = block.forward(store, &x)?.0;
        }
        let features = flatten(self.head_pool.forward(&x)?)?;
        Ok(self.logits.forward(store, &features)?)
    }

    /// Mean cross-entropy of a batch without recording a trace.
    pub fn evaluate<T: TensorElem + Float>(
        &self,
        store: &ParamStore<T>,
        images: &Tensor<T, 4>,
        labels: &Tensor<T, 2>,
    ) -> Result<T> {
        self.check_inputs(images, labels)?;
        let logits = self.logits(store, images)?;
        Ok(softmax_cross_entropy(&logits, labels)?.0)
    }

    /// Runs the network on a batch, returning the mean loss and the trace
    /// [`ResNet::backward`] consumes.
    pub fn forward<T: TensorElem + Float>(
        &self,
        store: &ParamStore<T>,
        images: Tensor<T, 4>,
        labels: &Tensor<T, 2>,
    ) -> Result<(T, Trace<T>)> {
        self.check_inputs(&images, labels)?;

        let stem = relu(&self.stem.forward(store, &images)?);
        let mut activations = Vec::with_capacity(self.blocks.len() + 1);
        activations.push(self.stem_pool.forward(&stem)?);
        let mut traces = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let input = activations.last().ok_or_else(|| {
                ModelError::TraceMismatch("no activation entering block".into())
            })?;
            let (out, trace) = block.forward(store, input)?;
            activations.push(out);
            traces.push(trace);
        }

        let last = activations
            .last()
            .ok_or_else(|| ModelError::TraceMismatch("no final activation".into()))?;
        let pooled = self.head_pool.forward(last)?;
        let head_shape = *pooled.shape();
        let features = flatten(pooled)?;
        let logits = self.logits.forward(store, &features)?;
        let (loss, grad_logits) = softmax_cross_entropy(&logits, labels)?;

        let trace = Trace {
            images,
            stem,
            activations,
            blocks: traces,
            head_shape,
            features,
            grad_logits,
            loss,
        };
        Ok((loss, trace))
    }

    /// Gradient of the traced loss with respect to every parameter in `store`.
    pub fn backward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        trace: &Trace<T>,
    ) -> Result<GradientBundle<T>> {
        if trace.blocks.len() != self.blocks.len() || trace.activations.len() != self.blocks.len() + 1 {
            return Err(ModelError::TraceMismatch(format!(
                "{} block traces for {} blocks",
                trace.blocks.len(),
                self.blocks.len()
            )));
        }
        let mut grads = Gradients::new();

        let d_features = self
            .logits
            .backward(store, &trace.features, &trace.grad_logits, &mut grads)?;
        let d_pooled = unflatten(d_features, trace.head_shape)?;
        let final_shape = *trace.activations[self.blocks.len()].shape();
        let mut d_x = self.head_pool.backward(final_shape, &d_pooled)?;

        for (i, block) in self.blocks.iter().enumerate().rev() {
            d_x = block.backward(
                store,
                &trace.activations[i],
                &trace.activations[i + 1],
                &trace.blocks[i],
                &d_x,
                &mut grads,
            )?;
        }

        let d_stem = self.stem_pool.backward(&trace.stem, &d_x)?;
        let d_stem = relu_backward(&trace.stem, &d_stem)?;
        self.stem
            .backward_filter(store, &trace.images, &d_stem, &mut grads)?;

        Ok(GradientBundle::from_gradients(store, grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::testutil::values;
    use crate::registry::ScopeId;

    fn tiny(rank: usize) -> (ParamStore<f64>, ResNet) {
        let mut store = ParamStore::new(ScopeId(rank), 5);
        let model = ResNet::new(
            &mut store,
            &Scope::device(rank),
            &ModelConfig::tiny(),
            [3, 8, 8],
            3,
        )
        .unwrap();
        (store, model)
    }

    fn batch(n: usize) -> (Tensor<f64, 4>, Tensor<f64, 2>) {
        let images = Tensor::new(
            values(n * 3 * 8 * 8, 7).iter().map(|v| (v + 1.0) / 2.0).collect(),
            [n, 3, 8, 8],
        )
        .unwrap();
        let mut labels = vec![0.0; n * 3];
        for i in 0..n {
            labels[i * 3 + i % 3] = 1.0;
        }
        (images, Tensor::new(labels, [n, 3]).unwrap())
    }

    #[test]
    fn test_allocation_order() {
        let (store, model) = tiny(0);
        let names: Vec<&str> = store.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names[0], "conv1/weights");
        assert_eq!(names[1], "stage1/block0/shortcut/weights");
        assert_eq!(names[2], "stage1/block0/reduce/weights");
        assert_eq!(names[names.len() - 2], "logits/weights");
        assert_eq!(names[names.len() - 1], "logits/bias");
        // stem + 3 blocks (2 with projections) + dense weight and bias
        assert_eq!(store.len(), 1 + 4 + 3 + 4 + 2);
        assert_eq!(model.plan().features, 32);
    }

    #[test]
    fn test_forward_evaluate_agree() {
        let (store, model) = tiny(0);
        let (images, labels) = batch(4);
        let eval = model.evaluate(&store, &images, &labels).unwrap();
        let (loss, trace) = model.forward(&store, images, &labels).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!((loss - eval).abs() < 1e-12);
        assert_eq!(trace.batch_size(), 4);
    }

    #[test]
    fn test_backward_covers_every_parameter() {
        let (store, model) = tiny(1);
        let (images, labels) = batch(2);
        let (_, trace) = model.forward(&store, images, &labels).unwrap();
        let bundle = model.backward(&store, &trace).unwrap();
        bundle.check_owned_by(&store).unwrap();
        assert!(bundle
            .entries
            .iter()
            .all(|e| e.grad.data().iter().all(|g| g.is_finite())));
    }

    #[test]
    fn test_gradient_step_lowers_loss() {
        let (mut store, model) = tiny(0);
        let (images, labels) = batch(3);
        let (before, trace) = model.forward(&store, images.clone(), &labels).unwrap();
        let bundle = model.backward(&store, &trace).unwrap();
        for entry in bundle.entries {
            let value = store.value_mut(entry.id).unwrap();
            for (p, g) in value.data_mut().iter_mut().zip(entry.grad.data()) {
                *p -= 1e-3 * g;
            }
        }
        let after = model.evaluate(&store, &images, &labels).unwrap();
        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn test_input_shape_rejected() {
        let (store, model) = tiny(0);
        let labels = Tensor::<f64, 2>::zeros([1, 3]);
        let err = model
            .evaluate(&store, &Tensor::zeros([1, 3, 9, 8]), &labels)
            .unwrap_err();
        assert!(matches!(err, ModelError::InputShape { .. }));
        let err = model
            .evaluate(&store, &Tensor::zeros([1, 3, 8, 8]), &Tensor::zeros([1, 2]))
            .unwrap_err();
        assert!(matches!(err, ModelError::InputShape { .. }));
    }
}
