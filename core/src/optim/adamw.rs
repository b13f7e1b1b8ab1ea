use super::{check_len, Optimizer};
use crate::tensor::{self, Result, TensorElem};
use num_traits::Float;
use rayon::prelude::*;
use std::collections::HashMap;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// A weight decay of zero recovers plain Adam.
pub struct AdamW<T: TensorElem> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub weight_decay: T,
    /// Slot -> (m, v, step)
    state: HashMap<usize, (Vec<T>, Vec<T>, i32)>,
}

impl<T: TensorElem + Float> AdamW<T> {
    /// Defaults: `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`,
    /// `weight_decay = 0.01`.
    pub fn new(learning_rate: T) -> Result<Self> {
        Ok(Self {
            learning_rate,
            beta1: tensor::elem(0.9)?,
            beta2: tensor::elem(0.999)?,
            epsilon: tensor::elem(1e-8)?,
            weight_decay: tensor::elem(0.01)?,
            state: HashMap::new(),
        })
    }

    pub fn with_betas(mut self, beta1: T, beta2: T) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: T) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: T) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl<T: TensorElem + Float> Optimizer<T> for AdamW<T> {
    fn update(&mut self, slot: usize, param: &mut [T], grad: &[T]) -> Result<()> {
        check_len(param, grad)?;
        let size = param.len();
        let (m, v, step) = self
            .state
            .entry(slot)
            .or_insert_with(|| (vec![T::zero(); size], vec![T::zero(); size], 0));
        check_len(m, grad)?;
        *step += 1;

        let lr = self.learning_rate;
        let b1 = self.beta1;
        let b2 = self.beta2;
        let eps = self.epsilon;
        let lambda = self.weight_decay;
        let one = T::one();
        let bias_correction1 = one - b1.powi(*step);
        let bias_correction2 = one - b2.powi(*step);

        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut())
            .zip(v.par_iter_mut())
            .for_each(|(((p, &g), m_elem), v_elem)| {
                *m_elem = b1 * *m_elem + (one - b1) * g;
                *v_elem = b2 * *v_elem + (one - b2) * g * g;

                let m_hat = *m_elem / bias_correction1;
                let v_hat = *v_elem / bias_correction2;
                *p = *p - lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            });

        Ok(())
    }

    fn name(&self) -> &'static str {
        "adamw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adamw_new() {
        let adam = AdamW::<f32>::new(0.001).unwrap();
        assert_eq!(adam.learning_rate, 0.001);
        assert_eq!(adam.beta1, 0.9);
        assert_eq!(adam.weight_decay, 0.01);
    }

    #[test]
    fn test_adamw_update() {
        let mut adam = AdamW::<f32>::new(0.1).unwrap().with_weight_decay(0.0);
        let mut param = vec![1.0];

        adam.update(0, &mut param, &[0.1]).unwrap();

        // m_hat = 0.1, v_hat = 0.01, p = 1.0 - 0.1 * (0.1 / 0.1) = 0.9
        assert!((param[0] - 0.9).abs() < 1e-5, "Step 1 failed: p={}", param[0]);

        // Constant gradient keeps m_hat / sqrt(v_hat) at 1.
        adam.update(0, &mut param, &[0.1]).unwrap();
        assert!((param[0] - 0.8).abs() < 1e-4, "Step 2 failed: p={}", param[0]);
    }
}
