use crate::{cast, check_len, nchw, KernelElem, Result};
use num_traits::Float;
use rayon::prelude::*;

/// Hyperparameters of local response normalisation across channels.
///
/// `y[c] = x[c] / (bias + alpha * sum(x[j]^2 for |j - c| <= depth_radius)) ^ beta`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrnParams {
    pub depth_radius: usize,
    pub bias: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for LrnParams {
    fn default() -> Self {
        Self {
            depth_radius: 4,
            bias: 1.0,
            alpha: 0.001 / 9.0,
            beta: 0.75,
        }
    }
}

struct Scalars<T> {
    bias: T,
    alpha: T,
    beta: T,
}

impl LrnParams {
    fn scalars<T: KernelElem>(&self) -> Result<Scalars<T>> {
        Ok(Scalars {
            bias: cast(self.bias)?,
            alpha: cast(self.alpha)?,
            beta: cast(self.beta)?,
        })
    }

    fn window(&self, c: usize, channels: usize) -> std::ops::RangeInclusive<usize> {
        c.saturating_sub(self.depth_radius)..=(c + self.depth_radius).min(channels - 1)
    }
}

/// Per-position normaliser `bias + alpha * windowed sum of squares`, laid out like the input.
fn norms<T: KernelElem + Float>(
    image: &[T],
    channels: usize,
    plane: usize,
    params: &LrnParams,
    s: &Scalars<T>,
) -> Vec<T> {
    let mut out = vec![T::zero(); image.len()];
    for p in 0..plane {
        for c in 0..channels {
            let mut sq = T::zero();
            for j in params.window(c, channels) {
                let v = image[j * plane + p];
                sq += v * v;
            }
            out[c * plane + p] = s.bias + s.alpha * sq;
        }
    }
    out
}

/// Local response normalisation over the channel axis of an NCHW tensor.
pub fn cpu_lrn<T: KernelElem + Float>(
    input: &[T],
    shape: &[usize],
    params: &LrnParams,
) -> Result<Vec<T>> {
    let [_, channels, h, w] = nchw(shape)?;
    check_len(input, shape)?;
    let s = params.scalars::<T>()?;
    let plane = h * w;
    let image_len = channels * plane;
    let mut output = vec![T::zero(); input.len()];
    if output.is_empty() {
        return Ok(output);
    }

    output
        .par_chunks_mut(image_len)
        .zip(input.par_chunks(image_len))
        .for_each(|(out, image)| {
            let n = norms(image, channels, plane, params, &s);
            for ((o, &x), &n) in out.iter_mut().zip(image).zip(&n) {
                *o = x * n.powf(-s.beta);
            }
        });

    Ok(output)
}

/// Gradient of [`cpu_lrn`] with respect to its input.
///
/// `dx[j] = dy[j] * n[j]^-beta - 2 alpha beta x[j] * sum(dy[i] x[i] n[i]^(-beta-1) for i near j)`
pub fn cpu_lrn_backward<T: KernelElem + Float>(
    input: &[T],
    grad_out: &[T],
    shape: &[usize],
    params: &LrnParams,
) -> Result<Vec<T>> {
    let [_, channels, h, w] = nchw(shape)?;
    check_len(input, shape)?;
    check_len(grad_out, shape)?;
    let s = params.scalars::<T>()?;
    let two: T = cast(2.0)?;
    let plane = h * w;
    let image_len = channels * plane;
    let mut grad_in = vec![T::zero(); input.len()];
    if grad_in.is_empty() {
        return Ok(grad_in);
    }

    grad_in
        .par_chunks_mut(image_len)
        .zip(input.par_chunks(image_len))
        .zip(grad_out.par_chunks(image_len))
        .for_each(|((dx, image), dy)| {
            let n = norms(image, channels, plane, params, &s);
            // dy[i] * x[i] * n[i]^(-beta - 1)
            let scaled: Vec<T> = (0..image.len())
                .map(|i| dy[i] * image[i] * n[i].powf(-s.beta - T::one()))
                .collect();
            let coeff = two * s.alpha * s.beta;
            for p in 0..plane {
                for j in 0..channels {
                    let idx = j * plane + p;
                    let mut cross = T::zero();
                    for i in params.window(j, channels) {
                        cross += scaled[i * plane + p];
                    }
                    dx[idx] = dy[idx] * n[idx].powf(-s.beta) - coeff * image[idx] * cross;
                }
            }
        });

    Ok(grad_in)
}
