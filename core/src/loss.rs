//! Classification loss.

use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;

/// Softmax cross-entropy against one-hot (or soft) labels, averaged over the batch.
///
/// Returns the scalar loss and its gradient with respect to `logits`:
/// `(softmax(logits) - labels) / batch`.
///
/// ```rust
/// use resnet_replica::loss::softmax_cross_entropy;
/// use resnet_replica::tensor::Tensor;
///
/// let logits = Tensor::<f64, 2>::zeros([1, 2]);
/// let labels = Tensor::<f64, 2>::new(vec![1.0, 0.0], [1, 2]).unwrap();
/// let (loss, _) = softmax_cross_entropy(&logits, &labels).unwrap();
/// assert!((loss - 2f64.ln()).abs() < 1e-12);
/// ```
pub fn softmax_cross_entropy<T: TensorElem + Float>(
    logits: &Tensor<T, 2>,
    labels: &Tensor<T, 2>,
) -> Result<(T, Tensor<T, 2>)> {
    if logits.shape() != labels.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: logits.shape().to_vec(),
            got: labels.shape().to_vec(),
        });
    }
    let [batch, classes] = *logits.shape();
    if batch == 0 || classes == 0 {
        return Err(TensorError::Unsupported(
            "cross-entropy over an empty batch".into(),
        ));
    }
    let inv_batch = T::one() / crate::tensor::elem::<T>(batch as f64)?;

    let mut total = T::zero();
    let mut grad = vec![T::zero(); batch * classes];
    for ((row, label), g) in logits
        .data()
        .chunks(classes)
        .zip(labels.data().chunks(classes))
        .zip(grad.chunks_mut(classes))
    {
        // log-sum-exp with the row maximum subtracted
        let max = row.iter().copied().fold(T::neg_infinity(), Float::max);
        let sum = row.iter().fold(T::zero(), |acc, &z| acc + (z - max).exp());
        let log_sum = sum.ln() + max;
        for ((&z, &y), g) in row.iter().zip(label).zip(g.iter_mut()) {
            total += y * (log_sum - z);
            *g = ((z - log_sum).exp() - y) * inv_batch;
        }
    }

    Ok((total * inv_batch, Tensor::new(grad, [batch, classes])?))
}
