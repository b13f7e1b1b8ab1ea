use super::{check_len, Optimizer};
use crate::tensor::{self, Result, TensorElem};
use num_traits::Float;
use rayon::prelude::*;
use std::collections::HashMap;

/// Adagrad.
///
/// $$ a_t = a_{t-1} + g_t^2, \qquad \theta_t = \theta_{t-1} - \eta \, g_t / \sqrt{a_t} $$
///
/// Every accumulator entry starts at `initial_accumulator` (0.1), which keeps
/// the first step bounded.
pub struct Adagrad<T: TensorElem> {
    pub learning_rate: T,
    pub initial_accumulator: T,
    accumulators: HashMap<usize, Vec<T>>,
}

impl<T: TensorElem> Adagrad<T> {
    pub fn new(learning_rate: T) -> Result<Self> {
        Ok(Self {
            learning_rate,
            initial_accumulator: tensor::elem(0.1)?,
            accumulators: HashMap::new(),
        })
    }

    pub fn with_initial_accumulator(mut self, value: T) -> Self {
        self.initial_accumulator = value;
        self
    }
}

impl<T: TensorElem + Float> Optimizer<T> for Adagrad<T> {
    fn update(&mut self, slot: usize, param: &mut [T], grad: &[T]) -> Result<()> {
        check_len(param, grad)?;
        let lr = self.learning_rate;
        let init = self.initial_accumulator;
        let acc = self
            .accumulators
            .entry(slot)
            .or_insert_with(|| vec![init; grad.len()]);
        check_len(acc, grad)?;

        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(acc.par_iter_mut())
            .for_each(|((p, &g), a)| {
                *a += g * g;
                *p -= lr * g / Float::sqrt(*a);
            });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "adagrad"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adagrad_first_steps() {
        let mut opt = Adagrad::new(0.01f64).unwrap();
        let mut param = vec![1.0, -1.0];
        opt.update(3, &mut param, &[0.3, 0.0]).unwrap();
        // acc = 0.1 + 0.09 = 0.19
        assert!((param[0] - (1.0 - 0.01 * 0.3 / 0.19f64.sqrt())).abs() < 1e-12);
        assert_eq!(param[1], -1.0);

        opt.update(3, &mut param, &[0.3, 0.0]).unwrap();
        let expected = 1.0 - 0.01 * 0.3 / 0.19f64.sqrt() - 0.01 * 0.3 / 0.28f64.sqrt();
        assert!((param[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_adagrad_rejects_resized_slot() {
        let mut opt = Adagrad::new(0.01f32).unwrap();
        let mut a = vec![0.0; 2];
        opt.update(0, &mut a, &[1.0, 1.0]).unwrap();
        let mut b = vec![0.0; 3];
        assert!(opt.update(0, &mut b, &[1.0, 1.0, 1.0]).is_err());
    }
}
