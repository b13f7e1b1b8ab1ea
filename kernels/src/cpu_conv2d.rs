use crate::{check_len, nchw, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Resolved shapes of one 2D convolution.
///
/// Input is `[batch, in_channels, in_h, in_w]`, the filter is
/// `[out_channels, in_channels, kernel_h, kernel_w]` and the output is
/// `[batch, out_channels, out_h, out_w]`. Padding is symmetric zero padding;
/// after padding the convolution is "valid" (no window leaves the padded input).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub out_h: usize,
    pub out_w: usize,
}

impl Conv2dGeometry {
    pub fn new(
        input_shape: &[usize],
        filter_shape: &[usize],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let [batch, in_channels, in_h, in_w] = nchw(input_shape)?;
        let [out_channels, filter_in, kernel_h, kernel_w] = nchw(filter_shape)?;

        if in_channels != filter_in {
            return Err(KernelError::ShapeMismatch {
                expected: vec![in_channels],
                got: vec![filter_in],
            });
        }
        if stride[0] == 0 || stride[1] == 0 {
            return Err(KernelError::InvalidGeometry(format!(
                "stride must be positive, got {stride:?}"
            )));
        }
        if kernel_h == 0 || kernel_w == 0 {
            return Err(KernelError::InvalidGeometry(format!(
                "kernel must be non-empty, got {kernel_h}x{kernel_w}"
            )));
        }

        let padded_h = in_h + 2 * padding[0];
        let padded_w = in_w + 2 * padding[1];
        if padded_h < kernel_h || padded_w < kernel_w {
            return Err(KernelError::InvalidGeometry(format!(
                "kernel {kernel_h}x{kernel_w} exceeds padded input {padded_h}x{padded_w}"
            )));
        }

        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            kernel_h,
            kernel_w,
            stride,
            padding,
            out_h: (padded_h - kernel_h) / stride[0] + 1,
            out_w: (padded_w - kernel_w) / stride[1] + 1,
        })
    }

    pub fn input_shape(&self) -> [usize; 4] {
        [self.batch, self.in_channels, self.in_h, self.in_w]
    }

    pub fn filter_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels,
            self.kernel_h,
            self.kernel_w,
        ]
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Maps an output position and kernel offset to an input coordinate,
    /// or `None` when it falls into the zero padding.
    #[inline]
    fn source(&self, oh: usize, ow: usize, kh: usize, kw: usize) -> Option<(usize, usize)> {
        let h = (oh * self.stride[0] + kh).checked_sub(self.padding[0])?;
        let w = (ow * self.stride[1] + kw).checked_sub(self.padding[1])?;
        (h < self.in_h && w < self.in_w).then_some((h, w))
    }
}

/// Performs 2D Convolution on CPU.
///
/// Parallelised over batch and output channel.
pub fn cpu_conv2d<T: KernelElem>(
    input: &[T],
    filter: &[T],
    geom: &Conv2dGeometry,
) -> Result<Vec<T>> {
    check_len(input, &geom.input_shape())?;
    check_len(filter, &geom.filter_shape())?;

    let in_plane = geom.in_h * geom.in_w;
    let in_stride_b = geom.in_channels * in_plane;
    let w_stride_out = geom.in_channels * geom.kernel_h * geom.kernel_w;
    let w_stride_in = geom.kernel_h * geom.kernel_w;
    let out_plane = geom.out_h * geom.out_w;
    let out_stride_b = geom.out_channels * out_plane;

    let mut output = vec![T::zero(); out_stride_b * geom.batch];
    if output.is_empty() {
        return Ok(output);
    }

    output
        .par_chunks_mut(out_stride_b)
        .enumerate()
        .for_each(|(b, batch_out)| {
            let image = &input[b * in_stride_b..(b + 1) * in_stride_b];
            batch_out
                .par_chunks_mut(out_plane)
                .enumerate()
                .for_each(|(oc, channel_out)| {
                    let oc_filter = &filter[oc * w_stride_out..(oc + 1) * w_stride_out];
                    for oh in 0..geom.out_h {
                        for ow in 0..geom.out_w {
                            let mut sum = T::zero();
                            for kh in 0..geom.kernel_h {
                                for kw in 0..geom.kernel_w {
                                    let Some((h, w)) = geom.source(oh, ow, kh, kw) else {
                                        continue;
                                    };
                                    let tap = kh * geom.kernel_w + kw;
                                    for ic in 0..geom.in_channels {
                                        sum += image[ic * in_plane + h * geom.in_w + w]
                                            * oc_filter[ic * w_stride_in + tap];
                                    }
                                }
                            }
                            channel_out[oh * geom.out_w + ow] = sum;
                        }
                    }
                });
        });

    Ok(output)
}

/// Gradient of the convolution with respect to its input.
///
/// `grad_out` has the output shape; the result has the input shape.
/// Parallelised over batch: every image accumulates into its own slice.
pub fn cpu_conv2d_backward_input<T: KernelElem>(
    grad_out: &[T],
    filter: &[T],
    geom: &Conv2dGeometry,
) -> Result<Vec<T>> {
    check_len(grad_out, &geom.output_shape())?;
    check_len(filter, &geom.filter_shape())?;

    let in_plane = geom.in_h * geom.in_w;
    let in_stride_b = geom.in_channels * in_plane;
    let w_stride_out = geom.in_channels * geom.kernel_h * geom.kernel_w;
    let w_stride_in = geom.kernel_h * geom.kernel_w;
    let out_plane = geom.out_h * geom.out_w;
    let out_stride_b = geom.out_channels * out_plane;

    let mut grad_in = vec![T::zero(); in_stride_b * geom.batch];
    if grad_in.is_empty() {
        return Ok(grad_in);
    }

    grad_in
        .par_chunks_mut(in_stride_b)
        .enumerate()
        .for_each(|(b, image_grad)| {
            let dy = &grad_out[b * out_stride_b..(b + 1) * out_stride_b];
            for oc in 0..geom.out_channels {
                let oc_filter = &filter[oc * w_stride_out..(oc + 1) * w_stride_out];
                for oh in 0..geom.out_h {
                    for ow in 0..geom.out_w {
                        let g = dy[oc * out_plane + oh * geom.out_w + ow];
                        if g == T::zero() {
                            continue;
                        }
                        for kh in 0..geom.kernel_h {
                            for kw in 0..geom.kernel_w {
                                let Some((h, w)) = geom.source(oh, ow, kh, kw) else {
                                    continue;
                                };
                                let tap = kh * geom.kernel_w + kw;
                                for ic in 0..geom.in_channels {
                                    image_grad[ic * in_plane + h * geom.in_w + w] +=
                                        g * oc_filter[ic * w_stride_in + tap];
                                }
                            }
                        }
                    }
                }
            }
        });

    Ok(grad_in)
}

/// Gradient of the convolution with respect to its filter.
///
/// Parallelised over output channel: each filter slab is owned by one task.
pub fn cpu_conv2d_backward_filter<T: KernelElem>(
    input: &[T],
    grad_out: &[T],
    geom: &Conv2dGeometry,
) -> Result<Vec<T>> {
    check_len(input, &geom.input_shape())?;
    check_len(grad_out, &geom.output_shape())?;

    let in_plane = geom.in_h * geom.in_w;
    let in_stride_b = geom.in_channels * in_plane;
    let w_stride_out = geom.in_channels * geom.kernel_h * geom.kernel_w;
    let w_stride_in = geom.kernel_h * geom.kernel_w;
    let out_plane = geom.out_h * geom.out_w;
    let out_stride_b = geom.out_channels * out_plane;

    let mut grad_filter = vec![T::zero(); w_stride_out * geom.out_channels];
    if grad_filter.is_empty() {
        return Ok(grad_filter);
    }

    grad_filter
        .par_chunks_mut(w_stride_out)
        .enumerate()
        .for_each(|(oc, oc_grad)| {
            for b in 0..geom.batch {
                let image = &input[b * in_stride_b..(b + 1) * in_stride_b];
                let dy = &grad_out[b * out_stride_b + oc * out_plane..][..out_plane];
                for oh in 0..geom.out_h {
                    for ow in 0..geom.out_w {
                        let g = dy[oh * geom.out_w + ow];
                        if g == T::zero() {
                            continue;
                        }
                        for kh in 0..geom.kernel_h {
                            for kw in 0..geom.kernel_w {
                                let Some((h, w)) = geom.source(oh, ow, kh, kw) else {
                                    continue;
                                };
                                let tap = kh * geom.kernel_w + kw;
                                for ic in 0..geom.in_channels {
                                    oc_grad[ic * w_stride_in + tap] +=
                                        g * image[ic * in_plane + h * geom.in_w + w];
                                }
                            }
                        }
                    }
                }
            }
        });

    Ok(grad_filter)
}
