use super::{check_len, Optimizer};
use crate::tensor::{Result, TensorElem};
use rayon::prelude::*;
use std::collections::HashMap;

/// Stochastic Gradient Descent, optionally with momentum.
///
/// Without momentum: `param = param - lr * grad`.
/// With momentum `m`: `acc = m * acc + grad; param = param - lr * acc`, where
/// `acc` starts at zero for every slot.
pub struct Sgd<T: TensorElem> {
    pub learning_rate: T,
    pub momentum: Option<T>,
    velocity: HashMap<usize, Vec<T>>,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            momentum: None,
            velocity: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: T) -> Self {
        self.momentum = Some(momentum);
        self
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn update(&mut self, slot: usize, param: &mut [T], grad: &[T]) -> Result<()> {
        check_len(param, grad)?;
        let lr = self.learning_rate;

        match self.momentum {
            None => param.par_iter_mut().zip(grad.par_iter()).for_each(|(p, &g)| {
                *p -= lr * g;
            }),
            Some(m) => {
                let acc = self
                    .velocity
                    .entry(slot)
                    .or_insert_with(|| vec![T::zero(); grad.len()]);
                check_len(acc, grad)?;
                param
                    .par_iter_mut()
                    .zip(grad.par_iter())
                    .zip(acc.par_iter_mut())
                    .for_each(|((p, &g), a)| {
                        *a = m * *a + g;
                        *p -= lr * *a;
                    });
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.momentum.is_some() {
            "momentum"
        } else {
            "sgd"
        }
    }
}
