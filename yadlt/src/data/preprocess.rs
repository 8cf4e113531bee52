//! Dataset preprocessing.
use candle_core::{DType, Tensor};

use crate::util::rng::{index_tensor, TensorRng};
use crate::util::tensor_ext::Binarize;

/// Largest raw pixel value.
pub const MAX_PIXEL: f64 = 255.0;

/// Scale raw pixels to real values in `[0, 1]`.
pub fn normalize(pixels: &Tensor) -> Result<Tensor, candle_core::Error> {
    pixels.to_dtype(DType::F32)? / MAX_PIXEL
}

/// Binary pixels: `1` when the normalized pixel is at least `0.5`.
pub fn binarize(pixels: &Tensor) -> Result<Tensor, candle_core::Error> {
    normalize(pixels)?.binarize(0.5)
}

/// Discretize raw pixels into `n_states` states.
///
/// Pixel `p` is mapped to state `floor(p * n_states / 256)`, so states are
/// in `[0, n_states)`. The result is a `u32` tensor.
pub fn discretize(pixels: &Tensor, n_states: usize) -> Result<Tensor, candle_core::Error> {
    check_n_states(n_states)?;
    pixels
        .to_dtype(DType::F32)?
        .affine(n_states as f64 / (MAX_PIXEL + 1.0), 0.)?
        .floor()?
        .clamp(0f32, (n_states - 1) as f32)?
        .to_dtype(DType::U32)
}

/// Expand unit states to one-hot vectors.
///
/// `states` has shape `(batch_size, n_units)` with values in
/// `[0, n_states)`, the result has shape `(batch_size, n_units * n_states)`
/// and the data type `f32`.
pub fn one_hot_states(states: &Tensor, n_states: usize) -> Result<Tensor, candle_core::Error> {
    check_n_states(n_states)?;
    let (batch_size, n_units) = states.dims2()?;
    let states = states.to_dtype(DType::U32)?.unsqueeze(2)?;
    let range = Tensor::arange(0u32, n_states as u32, states.device())?.reshape((1, 1, n_states))?;
    states
        .broadcast_eq(&range)?
        .to_dtype(DType::F32)?
        .reshape((batch_size, n_units * n_states))
}

/// One-hot encode class labels.
///
/// *Shape:* `(n_samples,)` to `(n_samples, n_classes)`
pub fn one_hot(labels: &Tensor, n_classes: usize) -> Result<Tensor, candle_core::Error> {
    one_hot_states(&labels.unsqueeze(1)?, n_classes)
}

fn check_n_states(n_states: usize) -> Result<(), candle_core::Error> {
    if n_states < 2 {
        candle_core::bail!("at least two states are needed, got {n_states}")
    }
    Ok(())
}

/// Shuffle the rows of a dataset and keep the first `n` samples.
pub fn shuffle_take(
    features: &Tensor,
    labels: &Tensor,
    n: usize,
    rng: &mut TensorRng,
) -> Result<(Tensor, Tensor), candle_core::Error> {
    let n_samples = features.dim(0)?;
    let mut permutation = rng.permutation(n_samples);
    permutation.truncate(n.min(n_samples));
    let indices = index_tensor(&permutation, features.device())?;
    Ok((
        features.index_select(&indices, 0)?,
        labels.index_select(&indices, 0)?,
    ))
}
