//! Loss functions.
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

// Keeps logarithms of sigmoid outputs finite.
const EPS: f64 = 1e-7;

/// Loss functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// Bernoulli cross-entropy between outputs in `(0, 1)` and targets in
    /// `[0, 1]`, summed over features and averaged over the batch.
    CrossEntropy,

    /// Mean squared error.
    MeanSquared,

    /// Cross-entropy of the softmax of the outputs (logits) and one-hot
    /// targets, averaged over the batch.
    SoftmaxCrossEntropy,
}

impl Loss {
    /// Compute the loss of `output` with respect to `targets`.
    ///
    /// Both tensors have shape `(batch_size, width)`. The result is a
    /// scalar tensor.
    pub fn compute(&self, output: &Tensor, targets: &Tensor) -> Result<Tensor, candle_core::Error> {
        match self {
            Loss::CrossEntropy => {
                let output = output.clamp(EPS, 1. - EPS)?;
                let positive = (targets * output.log()?)?;
                let negative = (targets.affine(-1., 1.)? * output.affine(-1., 1.)?.log()?)?;
                (positive + negative)?.sum(D::Minus1)?.mean_all()?.neg()
            }
            Loss::MeanSquared => (output - targets)?.sqr()?.mean_all(),
            Loss::SoftmaxCrossEntropy => {
                let log_probs = candle_nn::ops::log_softmax(output, D::Minus1)?;
                (targets * log_probs)?.sum(D::Minus1)?.mean_all()?.neg()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use candle_core::{Device, Tensor};
    use rstest::rstest;

    use super::Loss;

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    // Cross entropy sums -ln(0.8) and -ln(1 - 0.6) over the features.
    #[rstest]
    #[case(Loss::CrossEntropy, -(0.8f32.ln() + 0.4f32.ln()))]
    #[case(Loss::MeanSquared, (0.04 + 0.36) / 2.)]
    fn reconstruction_losses(#[case] loss: Loss, #[case] expected: f32) {
        let output = Tensor::new(&[[0.8f32, 0.6], [0.8, 0.6]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1f32, 0.], [1., 0.]], &Device::Cpu).unwrap();
        assert_relative_eq!(
            scalar(loss.compute(&output, &targets).unwrap()),
            expected,
            max_relative = 1e-4
        );
    }

    #[test]
    fn softmax_cross_entropy_of_uniform_logits() {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0f32, 1., 0., 0.], [0., 0., 0., 1.]], &Device::Cpu).unwrap();
        assert_relative_eq!(
            scalar(
                Loss::SoftmaxCrossEntropy
                    .compute(&logits, &targets)
                    .unwrap()
            ),
            4f32.ln(),
            max_relative = 1e-5
        );
    }
}
