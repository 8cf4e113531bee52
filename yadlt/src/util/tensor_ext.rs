/// Tensor extension traits.
use candle_core::{DType, Tensor, D};

/// Softmax over consecutive groups of columns.
pub trait GroupedSoftmax: Sized {
    /// Apply softmax to every group of `group_size` consecutive columns.
    ///
    /// The tensor must have shape `(batch_size, n_groups * group_size)`.
    fn grouped_softmax(&self, group_size: usize) -> Result<Self, candle_core::Error>;
}

impl GroupedSoftmax for Tensor {
    fn grouped_softmax(&self, group_size: usize) -> Result<Self, candle_core::Error> {
        let (batch_size, width) = self.dims2()?;
        if group_size == 0 || width % group_size != 0 {
            candle_core::bail!("width {width} is not a multiple of group size {group_size}")
        }
        let grouped = self.reshape((batch_size, width / group_size, group_size))?;
        candle_nn::ops::softmax_last_dim(&grouped.contiguous()?)?.reshape((batch_size, width))
    }
}

/// Threshold a tensor into a binary tensor.
pub trait Binarize: Sized {
    /// Elements greater than or equal to `threshold` become `1.0`, all
    /// other elements `0.0`. The result has the data type of `self`.
    fn binarize(&self, threshold: f64) -> Result<Self, candle_core::Error>;
}

impl Binarize for Tensor {
    fn binarize(&self, threshold: f64) -> Result<Self, candle_core::Error> {
        self.ge(threshold)?.to_dtype(self.dtype())
    }
}

/// Row-wise label predictions.
pub trait ArgmaxRows {
    /// Index of the largest element of each row as `u32` labels.
    fn argmax_rows(&self) -> Result<Tensor, candle_core::Error>;
}

impl ArgmaxRows for Tensor {
    fn argmax_rows(&self) -> Result<Tensor, candle_core::Error> {
        self.argmax(D::Minus1)?.to_dtype(DType::U32)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::{ArgmaxRows, Binarize, GroupedSoftmax};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn grouped_softmax_normalizes_each_group() -> Result<(), Whatever> {
        for device in test_devices() {
            let xs = Tensor::new(&[[0f32, 0., 1., 1., 2., 2.]], &device)
                .whatever_context("Cannot create tensor")?;
            let ys = xs
                .grouped_softmax(2)
                .whatever_context("Cannot apply grouped softmax")?;
            assert_tensor_eq!(
                ys,
                array![[0.5f32, 0.5, 0.5, 0.5, 0.5, 0.5]].into_dyn(),
                epsilon = 1e-6
            );
        }
        Ok(())
    }

    #[test]
    fn grouped_softmax_rejects_uneven_groups() {
        let xs = Tensor::zeros((2, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(xs.grouped_softmax(2).is_err());
    }

    #[test]
    #[report]
    fn binarize_and_argmax() -> Result<(), Whatever> {
        let xs = Tensor::new(&[[0.1f32, 0.5, 0.9], [0.7, 0.2, 0.3]], &Device::Cpu)
            .whatever_context("Cannot create tensor")?;
        let binary = xs
            .binarize(0.5)
            .and_then(|t| t.to_vec2::<f32>())
            .whatever_context("Cannot binarize")?;
        assert_eq!(binary, vec![vec![0., 1., 1.], vec![1., 0., 0.]]);

        let labels = xs
            .argmax_rows()
            .and_then(|t| t.to_vec1::<u32>())
            .whatever_context("Cannot take argmax")?;
        assert_eq!(labels, vec![2, 0]);
        Ok(())
    }
}
