use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::util::rng::TensorRng;
use crate::util::tensor_ext::GroupedSoftmax;

/// Unit types of a restricted Boltzmann machine layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Units {
    /// Binary stochastic units with a logistic activation.
    #[default]
    Bernoulli,

    /// Real-valued units with unit variance, the mean is the linear
    /// activation.
    Gaussian,

    /// Units with `n_states` mutually exclusive states. Every unit is
    /// represented by `n_states` one-hot columns and its state
    /// probabilities are the softmax of their activations.
    Multinomial { n_states: usize },
}

impl Units {
    /// Number of tensor columns used by `n_units` units.
    pub fn width(&self, n_units: usize) -> usize {
        match self {
            Units::Multinomial { n_states } => n_units * n_states,
            _ => n_units,
        }
    }

    /// Mean of the units given their total input.
    pub fn mean(&self, activation: &Tensor) -> Result<Tensor, candle_core::Error> {
        match self {
            Units::Bernoulli => candle_nn::ops::sigmoid(activation),
            Units::Gaussian => Ok(activation.clone()),
            Units::Multinomial { n_states } => activation.grouped_softmax(*n_states),
        }
    }

    /// Sample unit states given their mean.
    pub fn sample(&self, mean: &Tensor, rng: &mut TensorRng) -> Result<Tensor, candle_core::Error> {
        match self {
            Units::Bernoulli => rng.bernoulli(mean),
            Units::Gaussian => mean + rng.normal(mean.shape(), 0., 1., mean.device())?,
            Units::Multinomial { n_states } => rng.categorical(mean, *n_states),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self {
            Units::Multinomial { n_states } => *n_states >= 2,
            _ => true,
        }
    }
}
