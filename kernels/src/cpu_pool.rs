use crate::{cast, check_len, nchw, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Resolved shapes of an unpadded, strided pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub batch: usize,
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub out_h: usize,
    pub out_w: usize,
}

impl PoolGeometry {
    pub fn new(input_shape: &[usize], kernel: [usize; 2], stride: [usize; 2]) -> Result<Self> {
        let [batch, channels, in_h, in_w] = nchw(input_shape)?;
        if stride[0] == 0 || stride[1] == 0 {
            return Err(KernelError::InvalidGeometry(format!(
                "stride must be positive, got {stride:?}"
            )));
        }
        if kernel[0] == 0 || kernel[1] == 0 || kernel[0] > in_h || kernel[1] > in_w {
            return Err(KernelError::InvalidGeometry(format!(
                "window {kernel:?} does not fit input {in_h}x{in_w}"
            )));
        }
        Ok(Self {
            batch,
            channels,
            in_h,
            in_w,
            kernel,
            stride,
            out_h: (in_h - kernel[0]) / stride[0] + 1,
            out_w: (in_w - kernel[1]) / stride[1] + 1,
        })
    }

    pub fn input_shape(&self) -> [usize; 4] {
        [self.batch, self.channels, self.in_h, self.in_w]
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.channels, self.out_h, self.out_w]
    }

    fn planes(&self) -> (usize, usize) {
        (self.in_h * self.in_w, self.out_h * self.out_w)
    }

    /// Index (within one input plane) of the first maximum of a window.
    fn argmax<T: KernelElem>(&self, plane: &[T], oh: usize, ow: usize) -> usize {
        let h0 = oh * self.stride[0];
        let w0 = ow * self.stride[1];
        let mut best = h0 * self.in_w + w0;
        for h in h0..h0 + self.kernel[0] {
            for w in w0..w0 + self.kernel[1] {
                let idx = h * self.in_w + w;
                if plane[idx] > plane[best] {
                    best = idx;
                }
            }
        }
        best
    }
}

/// Performs 2D Max Pooling on CPU.
pub fn cpu_max_pool2d<T: KernelElem>(input: &[T], geom: &PoolGeometry) -> Result<Vec<T>> {
    check_len(input, &geom.input_shape())?;
    let (in_plane, out_plane) = geom.planes();
    let mut output = vec![T::zero(); out_plane * geom.batch * geom.channels];
    if output.is_empty() {
        return Ok(output);
    }

    output
        .par_chunks_mut(out_plane)
        .zip(input.par_chunks(in_plane))
        .for_each(|(out, plane)| {
            for oh in 0..geom.out_h {
                for ow in 0..geom.out_w {
                    out[oh * geom.out_w + ow] = plane[geom.argmax(plane, oh, ow)];
                }
            }
        });

    Ok(output)
}

/// Routes each output gradient to the first maximum of its window.
pub fn cpu_max_pool2d_backward<T: KernelElem>(
    input: &[T],
    grad_out: &[T],
    geom: &PoolGeometry,
) -> Result<Vec<T>> {
    check_len(input, &geom.input_shape())?;
    check_len(grad_out, &geom.output_shape())?;
    let (in_plane, out_plane) = geom.planes();
    let mut grad_in = vec![T::zero(); input.len()];
    if grad_in.is_empty() {
        return Ok(grad_in);
    }

    grad_in
        .par_chunks_mut(in_plane)
        .zip(input.par_chunks(in_plane))
        .zip(grad_out.par_chunks(out_plane))
        .for_each(|((dx, plane), dy)| {
            for oh in 0..geom.out_h {
                for ow in 0..geom.out_w {
                    dx[geom.argmax(plane, oh, ow)] += dy[oh * geom.out_w + ow];
                }
            }
        });

    Ok(grad_in)
}

/// Performs 2D Average Pooling on CPU.
pub fn cpu_avg_pool2d<T: KernelElem>(input: &[T], geom: &PoolGeometry) -> Result<Vec<T>> {
    check_len(input, &geom.input_shape())?;
    let (in_plane, out_plane) = geom.planes();
    let area: T = cast((geom.kernel[0] * geom.kernel[1]) as f64)?;
    let mut output = vec![T::zero(); out_plane * geom.batch * geom.channels];
    if output.is_empty() {
        return Ok(output);
    }

    output
        .par_chunks_mut(out_plane)
        .zip(input.par_chunks(in_plane))
        .for_each(|(out, plane)| {
            for oh in 0..geom.out_h {
                for ow in 0..geom.out_w {
                    let (h0, w0) = (oh * geom.stride[0], ow * geom.stride[1]);
                    let mut sum = T::zero();
                    for h in h0..h0 + geom.kernel[0] {
                        for w in w0..w0 + geom.kernel[1] {
                            sum += plane[h * geom.in_w + w];
                        }
                    }
                    out[oh * geom.out_w + ow] = sum / area;
                }
            }
        });

    Ok(output)
}

/// Spreads each output gradient evenly over its window.
pub fn cpu_avg_pool2d_backward<T: KernelElem>(
    grad_out: &[T],
    geom: &PoolGeometry,
) -> Result<Vec<T>> {
    check_len(grad_out, &geom.output_shape())?;
    let (in_plane, out_plane) = geom.planes();
    let area: T = cast((geom.kernel[0] * geom.kernel[1]) as f64)?;
    let mut grad_in = vec![T::zero(); in_plane * geom.batch * geom.channels];
    if grad_in.is_empty() {
        return Ok(grad_in);
    }

    grad_in
        .par_chunks_mut(in_plane)
        .zip(grad_out.par_chunks(out_plane))
        .for_each(|(dx, dy)| {
            for oh in 0..geom.out_h {
                for ow in 0..geom.out_w {
                    let share = dy[oh * geom.out_w + ow] / area;
                    let (h0, w0) = (oh * geom.stride[0], ow * geom.stride[1]);
                    for h in h0..h0 + geom.kernel[0] {
                        for w in w0..w0 + geom.kernel[1] {
                            dx[h * geom.in_w + w] += share;
                        }
                    }
                }
            }
        });

    Ok(grad_in)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dot, numeric_grad, values};

    #[test]
    fn test_pool_geometry() {
        // 3x3 stride 2 on 112 -> 55 (no padding)
        let g = PoolGeometry::new(&[1, 64, 112, 112], [3, 3], [2, 2]).unwrap();
        assert_eq!(g.output_shape(), [1, 64, 55, 55]);

        // 1x1 stride 2 (strided identity shortcut)
        let g = PoolGeometry::new(&[1, 8, 56, 56], [1, 1], [2, 2]).unwrap();
        assert_eq!((g.out_h, g.out_w), (28, 28));

        let err = PoolGeometry::new(&[1, 1, 2, 2], [3, 3], [1, 1]);
        assert!(matches!(err, Err(KernelError::InvalidGeometry(_))));
    }

    #[test]
    fn test_max_pool_values() {
        let input = vec![
            1.0, 2.0, 5.0, 6.0, //
            3.0, 4.0, 7.0, 8.0, //
            9.0, 10.0, 13.0, 14.0, //
            11.0, 12.0, 15.0, 16.0f32,
        ];
        let g = PoolGeometry::new(&[1, 1, 4, 4], [2, 2], [2, 2]).unwrap();
        let out = cpu_max_pool2d(&input, &g).unwrap();
        assert_eq!(out, vec![4.0, 8.0, 12.0, 16.0]);
    }

    #[test]
    fn test_max_pool_backward_routes_to_argmax() {
        let input = vec![1.0, 3.0, 2.0, 0.0f32];
        let g = PoolGeometry::new(&[1, 1, 2, 2], [2, 2], [1, 1]).unwrap();
        let dx = cpu_max_pool2d_backward(&input, &[5.0], &g).unwrap();
        assert_eq!(dx, vec![0.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_max_pool_backward_overlapping_windows() {
        // 3x3 windows stride 1 on 4x4: the global max wins all four windows.
        let mut input = vec![0.0f32; 16];
        input[5] = 9.0;
        let g = PoolGeometry::new(&[1, 1, 4, 4], [3, 3], [1, 1]).unwrap();
        let dx = cpu_max_pool2d_backward(&input, &[1.0; 4], &g).unwrap();
        assert_eq!(dx[5], 4.0);
        assert_eq!(dx.iter().sum::<f32>(), 4.0);
    }

    #[test]
    fn test_avg_pool_global() {
        let input: Vec<f32> = (0..8).map(|v| v as f32).collect();
        // Two channels of 2x2, global (2x2) average.
        let g = PoolGeometry::new(&[1, 2, 2, 2], [2, 2], [1, 1]).unwrap();
        let out = cpu_avg_pool2d(&input, &g).unwrap();
        assert_eq!(out, vec![1.5, 5.5]);
    }

    #[test]
    fn test_avg_pool_backward_matches_finite_difference() {
        let g = PoolGeometry::new(&[2, 3, 5, 5], [3, 3], [2, 2]).unwrap();
        let x = values(g.input_shape().iter().product(), 11);
        let dy = values(g.output_shape().iter().product(), 12);
        let dx = cpu_avg_pool2d_backward(&dy, &g).unwrap();
        for idx in [0, 12, 37, 74, x.len() - 1] {
            let num = numeric_grad(|xs| dot(&cpu_avg_pool2d(xs, &g).unwrap(), &dy), &x, idx);
            assert!((num - dx[idx]).abs() < 1e-6);
        }
    }
}
