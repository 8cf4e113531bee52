//! Multinomial logistic (softmax) regression.
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::data::batches::{batch_indices, select};
use crate::data::preprocess::one_hot;
use crate::training::metrics::mean;
use crate::training::{accuracy, Loss, MetricsError, OptimizerKind, TrainingHistory};
use crate::util::rng::TensorRng;
use crate::util::tensor_ext::ArgmaxRows;

/// Logistic regression errors.
#[derive(Debug, Snafu)]
pub enum LogisticRegressionError {
    #[snafu(display("Cannot compute accuracy"))]
    Accuracy { source: MetricsError },

    #[snafu(display("Cannot construct optimizer"))]
    BuildOptimizer { source: candle_core::Error },

    #[snafu(display("Cannot initialize parameters"))]
    Initialize { source: candle_core::Error },

    #[snafu(display("Got {n_samples} samples, but {n_labels} labels"))]
    LabelCount { n_samples: usize, n_labels: usize },

    #[snafu(display("Cannot predict class probabilities"))]
    Predict { source: candle_core::Error },

    #[snafu(display("Training step failed"))]
    TrainStep { source: candle_core::Error },
}

/// Logistic regression training configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticRegressionConfig {
    batch_size: usize,
    epochs: usize,
    l2: f64,
    learning_rate: f64,
    momentum: f64,
    optimizer: OptimizerKind,
}

impl LogisticRegressionConfig {
    /// Mini-batch size.
    ///
    /// Default: `100`
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Number of training epochs.
    ///
    /// Default: `20`
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// L2 penalty on the weights.
    ///
    /// Default: `1e-4`
    pub fn l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    /// Learning rate.
    ///
    /// Default: `0.1`
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Momentum, used by the momentum optimizer.
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

impl Default for LogisticRegressionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            epochs: 20,
            l2: 1e-4,
            learning_rate: 0.1,
            momentum: 0.5,
            optimizer: OptimizerKind::Momentum,
        }
    }
}

/// Softmax regression classifier.
pub struct LogisticRegression {
    config: LogisticRegressionConfig,
    linear: Linear,
    n_classes: usize,
    varmap: VarMap,
}

impl LogisticRegression {
    /// Construct an untrained classifier with zero weights.
    pub fn new(
        n_features: usize,
        n_classes: usize,
        config: LogisticRegressionConfig,
        device: &Device,
    ) -> Result<Self, LogisticRegressionError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let weight = vb
            .get_with_hints((n_classes, n_features), "weight", Init::Const(0.))
            .context(InitializeSnafu)?;
        let bias = vb
            .get_with_hints(n_classes, "bias", Init::Const(0.))
            .context(InitializeSnafu)?;

        Ok(Self {
            config,
            linear: Linear::new(weight, Some(bias)),
            n_classes,
            varmap,
        })
    }

    /// Number of classes.
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Fit the classifier.
    ///
    /// * `features` - *Shape:* `(n_samples, n_features)`
    /// * `labels` - Class indices, *shape:* `(n_samples,)`, `u32`.
    ///
    /// Returns the mean training cost per epoch.
    pub fn fit(
        &mut self,
        features: &Tensor,
        labels: &Tensor,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, LogisticRegressionError> {
        let n_samples = features.dim(0).context(TrainStepSnafu)?;
        let n_labels = labels.dim(0).context(TrainStepSnafu)?;
        ensure!(
            n_samples == n_labels,
            LabelCountSnafu {
                n_samples,
                n_labels
            }
        );

        let targets = one_hot(labels, self.n_classes).context(TrainStepSnafu)?;
        let mut optimizer = self
            .config
            .optimizer
            .build(
                self.varmap.all_vars(),
                self.config.learning_rate,
                self.config.momentum,
            )
            .context(BuildOptimizerSnafu)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..self.config.epochs {
            let batches = batch_indices(
                n_samples,
                self.config.batch_size,
                Some(&mut *rng),
                features.device(),
            )
            .context(TrainStepSnafu)?;

            let mut costs = Vec::with_capacity(batches.len());
            for indices in batches {
                let xs = select(features, &indices).context(TrainStepSnafu)?;
                let ys = select(&targets, &indices).context(TrainStepSnafu)?;
                let cost = self.cost(&xs, &ys).context(TrainStepSnafu)?;
                optimizer.backward_step(&cost).context(TrainStepSnafu)?;
                costs.push(
                    cost.to_dtype(DType::F64)
                        .and_then(|c| c.to_scalar::<f64>())
                        .context(TrainStepSnafu)?,
                );
            }

            let cost = mean(&costs);
            tracing::debug!(epoch, cost, "Logistic regression epoch finished");
            history.push(cost);
        }

        Ok(history)
    }

    fn cost(&self, xs: &Tensor, targets: &Tensor) -> Result<Tensor, candle_core::Error> {
        let logits = self.linear.forward(xs)?;
        let cost = Loss::SoftmaxCrossEntropy.compute(&logits, targets)?;
        if self.config.l2 > 0. {
            let penalty = (self.linear.weight().sqr()?.sum_all()? * (self.config.l2 / 2.))?;
            cost + penalty
        } else {
            Ok(cost)
        }
    }

    /// Class probabilities, *shape:* `(n_samples, n_classes)`.
    pub fn predict_proba(&self, features: &Tensor) -> Result<Tensor, LogisticRegressionError> {
        self.linear
            .forward(features)
            .and_then(|logits| candle_nn::ops::softmax_last_dim(&logits))
            .context(PredictSnafu)
    }

    /// Most probable class per sample, `u32`.
    pub fn predict(&self, features: &Tensor) -> Result<Tensor, LogisticRegressionError> {
        self.linear
            .forward(features)
            .and_then(|logits| logits.argmax_rows())
            .context(PredictSnafu)
    }

    /// Mean accuracy on the given samples.
    pub fn score(&self, features: &Tensor, labels: &Tensor) -> Result<f32, LogisticRegressionError> {
        accuracy(&self.predict(features)?, labels).context(AccuracySnafu)
    }
}
