use super::config::{BlockPlan, ShortcutKind};
use super::{ModelError, Result};
use crate::nn::{relu, relu_backward, Conv2d, Gradients, MaxPool2d};
use crate::registry::{ParamStore, Scope};
use crate::tensor::{Tensor, TensorElem};

/// Shortcut operand of a bottleneck block, chosen from its [`BlockPlan`].
#[derive(Debug, Clone)]
pub enum Shortcut {
    Identity,
    StridedPool(MaxPool2d),
    /// 1x1 strided convolution. Its output goes through ReLU before the sum.
    Projection(Conv2d),
}

/// Residual unit: 1x1 reduce -> ReLU -> 3x3 -> ReLU -> 1x1 expand, plus the
/// shortcut, then ReLU.
#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub plan: BlockPlan,
    pub reduce: Conv2d,
    pub spatial: Conv2d,
    pub expand: Conv2d,
    pub shortcut: Shortcut,
}

/// Activations a block keeps for its backward pass. The block input and
/// output are owned by the surrounding network trace.
#[derive(Debug, Clone)]
pub struct BottleneckTrace<T: TensorElem> {
    reduced: Tensor<T, 4>,
    spatial: Tensor<T, 4>,
    projected: Option<Tensor<T, 4>>,
}

impl Bottleneck {
    /// Allocates the block's weights under `<parent>/<plan.name>`, shortcut first.
    pub fn new<T: TensorElem>(
        store: &mut ParamStore<T>,
        parent: &Scope,
        plan: &BlockPlan,
    ) -> Result<Self> {
        let scope = plan
            .name
            .split('/')
            .fold(parent.clone(), |scope, part| scope.child(part));

        let shortcut = match plan.shortcut {
            ShortcutKind::Identity => Shortcut::Identity,
            ShortcutKind::StridedPool => Shortcut::StridedPool(plan.shortcut_pool()),
            ShortcutKind::Projection => Shortcut::Projection(Conv2d::new(
                store,
                &scope.child("shortcut"),
                plan.in_channels,
                plan.projection_spec(),
            )?),
        };
        let reduce = Conv2d::new(
            store,
            &scope.child("reduce"),
            plan.in_channels,
            plan.reduce_spec(),
        )?;
        let spatial = Conv2d::new(
            store,
            &scope.child("conv3x3"),
            plan.bottleneck,
            plan.spatial_spec(),
        )?;
        let expand = Conv2d::new(
            store,
            &scope.child("expand"),
            plan.bottleneck,
            plan.expand_spec(),
        )?;

        Ok(Self {
            plan: plan.clone(),
            reduce,
            spatial,
            expand,
            shortcut,
        })
    }

    pub fn forward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 4>,
    ) -> Result<(Tensor<T, 4>, BottleneckTrace<T>)> {
        let reduced = relu(&self.reduce.forward(store, input)?);
        let spatial = relu(&self.spatial.forward(store, &reduced)?);
        let expanded = self.expand.forward(store, &spatial)?;

        let (sum, projected) = match &self.shortcut {
            Shortcut::Identity => ((&expanded + input)?, None),
            Shortcut::StridedPool(pool) => ((&expanded + &pool.forward(input)?)?, None),
            Shortcut::Projection(conv) => {
                let projected = relu(&conv.forward(store, input)?);
                ((&expanded + &projected)?, Some(projected))
            }
        };

        let trace = BottleneckTrace {
            reduced,
            spatial,
            projected,
        };
        Ok((relu(&sum), trace))
    }

    /// Returns the gradient with respect to `input`; `output` is what
    /// [`Bottleneck::forward`] returned for it.
    pub fn backward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 4>,
        output: &Tensor<T, 4>,
        trace: &BottleneckTrace<T>,
        grad_out: &Tensor<T, 4>,
        grads: &mut Gradients<T>,
    ) -> Result<Tensor<T, 4>> {
        let d_sum = relu_backward(output, grad_out)?;

        let d_spatial = self.expand.backward(store, &trace.spatial, &d_sum, grads)?;
        let d_spatial = relu_backward(&trace.spatial, &d_spatial)?;
        let d_reduced = self.spatial.backward(store, &trace.reduced, &d_spatial, grads)?;
        let d_reduced = relu_backward(&trace.reduced, &d_reduced)?;
        let mut d_input = self.reduce.backward(store, input, &d_reduced, grads)?;

        let d_shortcut = match (&self.shortcut, &trace.projected) {
            (Shortcut::Identity, _) => d_sum,
            (Shortcut::StridedPool(pool), _) => pool.backward(input, &d_sum)?,
            (Shortcut::Projection(conv), Some(projected)) => {
                let d_projected = relu_backward(projected, &d_sum)?;
                conv.backward(store, input, &d_projected, grads)?
            }
            (Shortcut::Projection(_), None) => {
                return Err(ModelError::TraceMismatch(format!(
                    "{}: projection output was not recorded",
                    self.plan.name
                )));
            }
        };
        d_input.add_assign(&d_shortcut)?;
        Ok(d_input)
    }
}
