//! Broadcasting per-timestep coefficients against sample batches

use candle_core::{DType, Device, Shape, Tensor};

use crate::error::{DiffusionError, Result};

/// Read a timestep batch `[B]` into host indices, validating each against
/// `[0, num_timesteps)`.
pub fn timesteps_to_vec(t: &Tensor, num_timesteps: usize) -> Result<Vec<usize>> {
    if !t.dtype().is_int() {
        return Err(DiffusionError::InvalidTimestepDType(t.dtype()));
    }
    if t.rank() != 1 {
        return Err(DiffusionError::InvalidRank {
            expected: 1,
            got: t.dims().to_vec(),
        });
    }
    t.to_dtype(DType::I64)?
        .to_vec1::<i64>()?
        .into_iter()
        .map(|step| {
            if step < 0 || step as usize >= num_timesteps {
                Err(DiffusionError::TimestepOutOfRange {
                    t: step,
                    num_timesteps,
                })
            } else {
                Ok(step as usize)
            }
        })
        .collect()
}

/// Gather `coeffs[t[i]]` for every batch element and shape the result as
/// `[B, 1, 1, ...]` with the rank of `x_shape`, in `dtype` on `device`.
pub fn gather(
    coeffs: &[f64],
    t: &Tensor,
    x_shape: &Shape,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let indices = timesteps_to_vec(t, coeffs.len())?;
    let batch = check_batch(indices.len(), x_shape)?;
    let values: Vec<f64> = indices.iter().map(|&i| coeffs[i]).collect();
    Ok(Tensor::from_vec(values, broadcast_shape(batch, x_shape.rank()), device)?.to_dtype(dtype)?)
}

/// `[B, 1, 1, ...]` with `rank` dimensions
pub(crate) fn broadcast_shape(batch: usize, rank: usize) -> Shape {
    let mut dims = vec![1usize; rank.max(1)];
    dims[0] = batch;
    Shape::from(dims)
}

/// Check that the timestep batch length matches the leading dimension of
/// the sample shape and return the batch size.
pub(crate) fn check_batch(num_timesteps_in_batch: usize, x_shape: &Shape) -> Result<usize> {
    let batch = match x_shape.dims().first() {
        Some(&b) => b,
        None => {
            return Err(DiffusionError::InvalidRank {
                expected: 1,
                got: vec![],
            });
        }
    };
    if batch != num_timesteps_in_batch {
        return Err(DiffusionError::BatchMismatch {
            expected: batch,
            got: num_timesteps_in_batch,
        });
    }
    Ok(batch)
}
