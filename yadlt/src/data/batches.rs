//! Mini-batches.
use candle_core::{Device, Tensor};

use crate::util::rng::{index_tensor, TensorRng};

/// Split `n_samples` into mini-batches of at most `batch_size` samples.
///
/// Each batch is returned as an index tensor that can be used with
/// `Tensor::index_select`. When `rng` is given the samples are shuffled
/// first. The last batch holds the remaining samples and may be smaller.
pub fn batch_indices(
    n_samples: usize,
    batch_size: usize,
    rng: Option<&mut TensorRng>,
    device: &Device,
) -> Result<Vec<Tensor>, candle_core::Error> {
    let order = match rng {
        Some(rng) => rng.permutation(n_samples),
        None => (0..n_samples as u32).collect(),
    };

    order
        .chunks(batch_size.max(1))
        .map(|chunk| index_tensor(chunk, device))
        .collect()
}

/// Select the rows of `data` for a mini-batch.
pub fn select(data: &Tensor, indices: &Tensor) -> Result<Tensor, candle_core::Error> {
    data.index_select(indices, 0)
}
