use crate::{check_len, KernelElem, Result};
use rayon::prelude::*;

/// Swaps the last two dimensions of the input data.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(data, shape)?;
    let m = shape[RANK - 2];
    let n = shape[RANK - 1];

    let mut new_shape = *shape;
    new_shape.swap(RANK - 1, RANK - 2);
    let size: usize = new_shape.iter().product();
    let mut out_data = vec![T::zero(); size];
    if size == 0 {
        return Ok(out_data);
    }

    // Output rows: [Batch * N, M]
    out_data
        .as_mut_slice()
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(i, out_row)| {
            let batch_idx = i / n;
            let col_idx = i % n;
            let input_batch_offset = batch_idx * m * n;
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[input_batch_offset + r * n + col_idx];
            }
        });

    Ok(out_data)
}
