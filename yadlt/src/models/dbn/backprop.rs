//! Supervised fine-tuning with backpropagation.
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::{BackpropSnafu, Dbn, DbnError, NotFineTunedSnafu, SetParametersSnafu};
use crate::data::batches::{batch_indices, select};
use crate::data::preprocess::one_hot;
use crate::training::metrics::mean;
use crate::training::{Loss, OptimizerKind, Schedule, TrainingHistory};
use crate::util::rng::TensorRng;
use crate::util::tensor_ext::ArgmaxRows;

/// Backpropagation fine-tuning configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpropConfig {
    batch_size: usize,
    epochs: usize,
    learning_rate: Schedule,
    momentum: f64,
    optimizer: OptimizerKind,
}

impl BackpropConfig {
    /// Mini-batch size.
    ///
    /// Default: `10`
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Number of training epochs.
    ///
    /// Default: `10`
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Learning rate schedule.
    ///
    /// Default: `Schedule::constant(0.01)`
    pub fn learning_rate(mut self, learning_rate: impl Into<Schedule>) -> Self {
        self.learning_rate = learning_rate.into();
        self
    }

    /// Momentum of the momentum optimizer.
    ///
    /// Default: `0.5`
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Optimizer.
    ///
    /// Default: `OptimizerKind::Momentum`
    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }
}

impl Default for BackpropConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            epochs: 10,
            learning_rate: Schedule::constant(0.01),
            momentum: 0.5,
            optimizer: OptimizerKind::Momentum,
        }
    }
}

/// Softmax output layer on top of the last RBM.
pub(crate) struct SoftmaxOutput {
    weight: Tensor,
    bias: Tensor,
}

impl SoftmaxOutput {
    fn logits(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        xs.matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Trainable copy of a recognition layer.
struct SigmoidLayer {
    weight: Var,
    bias: Var,
}

impl SigmoidLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        candle_nn::ops::sigmoid(&xs.matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

impl Dbn {
    /// Fine-tune the recognition weights and a new softmax output layer
    /// with backpropagation.
    ///
    /// The tuned weights and hidden biases are written back into the RBMs.
    ///
    /// Returns the softmax cross-entropy per epoch.
    pub fn backprop(
        &mut self,
        n_classes: usize,
        data: &Tensor,
        labels: &Tensor,
        config: &BackpropConfig,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, DbnError> {
        Self::check_labels(data, labels)?;
        let device = data.device();

        let layers = self
            .rbms
            .iter()
            .map(|rbm| {
                Ok(SigmoidLayer {
                    weight: Var::from_tensor(rbm.weights())?,
                    bias: Var::from_tensor(rbm.hidden_bias())?,
                })
            })
            .collect::<Result<Vec<_>, candle_core::Error>>()
            .context(BackpropSnafu)?;

        let n_last = self.top_rbm().config().hidden_width();
        let output_weight = rng
            .uniform((n_last, n_classes), device)
            .and_then(|w| w * 0.01)
            .and_then(|w| Var::from_tensor(&w))
            .context(BackpropSnafu)?;
        let output_bias = Tensor::zeros(n_classes, DType::F32, device)
            .and_then(|b| Var::from_tensor(&b))
            .context(BackpropSnafu)?;

        let mut vars = layers
            .iter()
            .flat_map(|layer| [layer.weight.clone(), layer.bias.clone()])
            .collect::<Vec<_>>();
        vars.extend([output_weight.clone(), output_bias.clone()]);
        let mut optimizer = config
            .optimizer
            .build(
                vars,
                config.learning_rate.value(0, config.epochs),
                config.momentum,
            )
            .context(BackpropSnafu)?;

        let targets = one_hot(labels, n_classes).context(BackpropSnafu)?;
        let n_samples = data.dim(0).context(BackpropSnafu)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..config.epochs {
            let learning_rate = config.learning_rate.value(epoch, config.epochs);
            optimizer.set_learning_rate(learning_rate);

            let batches = batch_indices(n_samples, config.batch_size, Some(&mut *rng), device)
                .context(BackpropSnafu)?;
            let mut costs = Vec::with_capacity(batches.len());
            for indices in batches {
                let cost = (|| {
                    let mut xs = select(data, &indices)?;
                    let ys = select(&targets, &indices)?;
                    for layer in &layers {
                        xs = layer.forward(&xs)?;
                    }
                    let logits = xs.matmul(&output_weight)?.broadcast_add(&output_bias)?;
                    let cost = Loss::SoftmaxCrossEntropy.compute(&logits, &ys)?;
                    optimizer.backward_step(&cost)?;
                    cost.to_dtype(DType::F64)?.to_scalar::<f64>()
                })()
                .context(BackpropSnafu)?;
                costs.push(cost);
            }

            let cost = mean(&costs);
            tracing::info!(
                epoch,
                learning_rate,
                cross_entropy = cost,
                "Backpropagation epoch finished"
            );
            history.push(cost);
        }

        for (rbm, layer) in self.rbms.iter_mut().zip(&layers) {
            let visible_bias = rbm.visible_bias().clone();
            rbm.set_parameters(
                layer.weight.as_tensor().detach(),
                visible_bias,
                layer.bias.as_tensor().detach(),
            )
            .context(SetParametersSnafu)?;
        }
        self.softmax = Some(SoftmaxOutput {
            weight: output_weight.as_tensor().detach(),
            bias: output_bias.as_tensor().detach(),
        });
        self.history.extend(&history);

        Ok(history)
    }

    /// Predict labels with the softmax layer trained by [`Dbn::backprop`].
    pub fn predict_bp(&self, data: &Tensor) -> Result<Tensor, DbnError> {
        let softmax = self.softmax.as_ref().context(NotFineTunedSnafu {
            step: "Backpropagation",
        })?;
        let last = self.last_representation(data)?;
        softmax
            .logits(&last)
            .and_then(|logits| logits.argmax_rows())
            .context(BackpropSnafu)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::BackpropConfig;
    use crate::models::dbn::tests::{labelled_patterns, pretrained, rng};
    use crate::models::dbn::DbnError;
    use crate::training::accuracy;
    use crate::util::rng::TensorRng;

    #[rstest]
    fn fine_tunes_and_predicts(mut rng: TensorRng) {
        let (data, labels) = labelled_patterns(60, &mut rng);
        let mut dbn = pretrained(vec![8, 6, 4], &data, &mut rng);

        assert!(matches!(
            dbn.predict_bp(&data),
            Err(DbnError::NotFineTuned { .. })
        ));

        let history = dbn
            .backprop(
                2,
                &data,
                &labels,
                &BackpropConfig::default().epochs(40).learning_rate(0.5),
                &mut rng,
            )
            .unwrap();
        assert_eq!(history.errors().len(), 40);
        assert!(history.last().unwrap() < history.errors()[0]);

        let predictions = dbn.predict_bp(&data).unwrap();
        let accuracy = accuracy(&predictions, &labels).unwrap();
        assert!(accuracy > 0.9, "accuracy: {accuracy}");
    }
}
