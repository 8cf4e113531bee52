//! Restricted Boltzmann machines.
//!
//! A single machine type covers the standard (Bernoulli-Bernoulli),
//! Gaussian-Bernoulli and multinomial variants through the [`Units`] of its
//! visible and hidden layers. Training uses contrastive divergence (CD-k,
//! Hinton, 2002).
//!
//! See [A Practical Guide to Training Restricted Boltzmann Machines](https://www.cs.toronto.edu/~hinton/absps/guideTR.pdf).
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::data::batches::{batch_indices, select};
use crate::training::{Schedule, TrainingHistory};
use crate::util::rng::TensorRng;

mod units;
pub use units::Units;

/// RBM errors.
#[derive(Debug, Snafu)]
pub enum RbmError {
    #[snafu(display("Cannot compute unit activations"))]
    Activation { source: candle_core::Error },

    #[snafu(display("Checkpoint {what} has shape {got:?}, expected {expected:?}"))]
    CheckpointShape {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[snafu(display("Cannot create checkpoint file: {}", path.to_string_lossy()))]
    CreateCheckpoint { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot compute contrastive divergence gradients"))]
    Gradients { source: candle_core::Error },

    #[snafu(display("Cannot initialize parameters"))]
    Initialize { source: candle_core::Error },

    #[snafu(display("Input has {got} columns, expected {expected}"))]
    InputWidth { expected: usize, got: usize },

    #[snafu(display("Invalid unit configuration: {units:?}"))]
    InvalidUnits { units: Units },

    #[snafu(display("Cannot open checkpoint file: {}", path.to_string_lossy()))]
    OpenCheckpoint { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse checkpoint file: {}", path.to_string_lossy()))]
    ParseCheckpoint {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot compute reconstruction error"))]
    Reconstruct { source: candle_core::Error },

    #[snafu(display("Cannot sample unit states"))]
    Sample { source: candle_core::Error },

    #[snafu(display("Cannot convert parameters"))]
    ToVec { source: candle_core::Error },

    #[snafu(display("Cannot update parameters"))]
    Update { source: candle_core::Error },

    #[snafu(display("Cannot write checkpoint"))]
    WriteCheckpoint { source: serde_json::Error },
}

/// RBM configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbmConfig {
    hidden_units: Units,
    init_stdev: f32,
    n_hidden: usize,
    n_visible: usize,
    visible_units: Units,
}

impl RbmConfig {
    /// Hidden unit type.
    ///
    /// Default: `Units::Bernoulli`
    pub fn hidden_units(mut self, hidden_units: Units) -> Self {
        self.hidden_units = hidden_units;
        self
    }

    /// Standard deviation of the initial weights.
    ///
    /// Default: `0.01`
    pub fn init_stdev(mut self, init_stdev: f32) -> Self {
        self.init_stdev = init_stdev;
        self
    }

    /// Number of hidden units.
    ///
    /// Default: `250`
    pub fn n_hidden(mut self, n_hidden: usize) -> Self {
        self.n_hidden = n_hidden;
        self
    }

    /// Number of visible units.
    ///
    /// Default: `784`
    pub fn n_visible(mut self, n_visible: usize) -> Self {
        self.n_visible = n_visible;
        self
    }

    /// Visible unit type.
    ///
    /// Default: `Units::Bernoulli`
    pub fn visible_units(mut self, visible_units: Units) -> Self {
        self.visible_units = visible_units;
        self
    }

    /// Number of visible tensor columns.
    pub fn visible_width(&self) -> usize {
        self.visible_units.width(self.n_visible)
    }

    /// Number of hidden tensor columns.
    pub fn hidden_width(&self) -> usize {
        self.hidden_units.width(self.n_hidden)
    }

    /// Build an RBM with small random weights and zero biases.
    pub fn build(&self, device: &Device, rng: &mut TensorRng) -> Result<Rbm, RbmError> {
        self.validate()?;
        let weights = rng
            .normal(
                (self.visible_width(), self.hidden_width()),
                0.,
                self.init_stdev,
                device,
            )
            .context(InitializeSnafu)?;
        let visible_bias =
            Tensor::zeros(self.visible_width(), DType::F32, device).context(InitializeSnafu)?;
        let hidden_bias =
            Tensor::zeros(self.hidden_width(), DType::F32, device).context(InitializeSnafu)?;

        Ok(Rbm {
            config: self.clone(),
            weights,
            visible_bias,
            hidden_bias,
        })
    }

    fn validate(&self) -> Result<(), RbmError> {
        for units in [self.visible_units, self.hidden_units] {
            ensure!(units.is_valid(), InvalidUnitsSnafu { units });
        }
        Ok(())
    }
}

impl Default for RbmConfig {
    fn default() -> Self {
        Self {
            hidden_units: Units::Bernoulli,
            init_stdev: 0.01,
            n_hidden: 250,
            n_visible: 784,
            visible_units: Units::Bernoulli,
        }
    }
}

/// RBM training configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbmTrainingConfig {
    batch_size: usize,
    epochs: usize,
    gibbs_k: usize,
    learning_rate: Schedule,
    momentum: Schedule,
    weight_cost: f64,
}

impl RbmTrainingConfig {
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

    /// Number of Gibbs sampling steps per update (the `k` of CD-k).
    ///
    /// Default: `1`
    pub fn gibbs_k(mut self, gibbs_k: usize) -> Self {
        self.gibbs_k = gibbs_k;
        self
    }

    /// Learning rate schedule.
    ///
    /// Default: `Schedule::constant(0.01)`
    pub fn learning_rate(mut self, learning_rate: impl Into<Schedule>) -> Self {
        self.learning_rate = learning_rate.into();
        self
    }

    /// Momentum schedule.
    ///
    /// Default: `Schedule::constant(0.5)`
    pub fn momentum(mut self, momentum: impl Into<Schedule>) -> Self {
        self.momentum = momentum.into();
        self
    }

    /// L2 weight cost.
    ///
    /// Default: `0.0`
    pub fn weight_cost(mut self, weight_cost: f64) -> Self {
        self.weight_cost = weight_cost;
        self
    }

    /// Get the mini-batch size.
    pub fn get_batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get the number of epochs.
    pub fn get_epochs(&self) -> usize {
        self.epochs
    }
}

impl Default for RbmTrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            epochs: 10,
            gibbs_k: 1,
            learning_rate: Schedule::constant(0.01),
            momentum: Schedule::constant(0.5),
            weight_cost: 0.,
        }
    }
}

/// Final state of a Gibbs sampling chain.
pub struct GibbsSample {
    /// Mean of the visible units.
    pub visible: Tensor,
    /// Mean of the hidden units.
    pub hidden_probs: Tensor,
    /// Sampled hidden states.
    pub hidden_states: Tensor,
}

/// Contrastive divergence gradient estimates, averaged over a batch.
pub struct Gradients {
    pub weights: Tensor,
    pub visible_bias: Tensor,
    pub hidden_bias: Tensor,
}

/// Restricted Boltzmann machine.
#[derive(Clone, Debug)]
pub struct Rbm {
    config: RbmConfig,
    weights: Tensor,
    visible_bias: Tensor,
    hidden_bias: Tensor,
}

impl Rbm {
    /// Construct an RBM from existing parameters.
    ///
    /// * `weights` - *Shape:* `(visible_width, hidden_width)`
    /// * `visible_bias` - *Shape:* `(visible_width,)`
    /// * `hidden_bias` - *Shape:* `(hidden_width,)`
    pub fn from_parameters(
        config: RbmConfig,
        weights: Tensor,
        visible_bias: Tensor,
        hidden_bias: Tensor,
    ) -> Result<Self, RbmError> {
        config.validate()?;
        check_shape(
            "weights",
            &weights,
            &[config.visible_width(), config.hidden_width()],
        )?;
        check_shape("visible bias", &visible_bias, &[config.visible_width()])?;
        check_shape("hidden bias", &hidden_bias, &[config.hidden_width()])?;
        Ok(Self {
            config,
            weights,
            visible_bias,
            hidden_bias,
        })
    }

    /// Machine configuration.
    pub fn config(&self) -> &RbmConfig {
        &self.config
    }

    /// Number of visible units.
    pub fn n_visible(&self) -> usize {
        self.config.n_visible
    }

    /// Number of hidden units.
    pub fn n_hidden(&self) -> usize {
        self.config.n_hidden
    }

    /// Weights, *shape:* `(visible_width, hidden_width)`.
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Visible biases.
    pub fn visible_bias(&self) -> &Tensor {
        &self.visible_bias
    }

    /// Hidden biases.
    pub fn hidden_bias(&self) -> &Tensor {
        &self.hidden_bias
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        self.weights.device()
    }

    /// Replace the parameters, the shapes must not change.
    pub(crate) fn set_parameters(
        &mut self,
        weights: Tensor,
        visible_bias: Tensor,
        hidden_bias: Tensor,
    ) -> Result<(), RbmError> {
        *self = Self::from_parameters(self.config.clone(), weights, visible_bias, hidden_bias)?;
        Ok(())
    }

    /// Mean of the hidden units given visible states.
    ///
    /// * `visible` - *Shape:* `(batch_size, visible_width)`
    pub fn hidden_probs(&self, visible: &Tensor) -> Result<Tensor, RbmError> {
        self.check_input(visible)?;
        visible
            .matmul(&self.weights)
            .and_then(|xs| xs.broadcast_add(&self.hidden_bias))
            .and_then(|xs| self.config.hidden_units.mean(&xs))
            .context(ActivationSnafu)
    }

    /// Mean of the visible units given hidden states.
    ///
    /// * `hidden` - *Shape:* `(batch_size, hidden_width)`
    pub fn visible_probs(&self, hidden: &Tensor) -> Result<Tensor, RbmError> {
        hidden
            .matmul(&self.weights.t().context(ActivationSnafu)?)
            .and_then(|xs| xs.broadcast_add(&self.visible_bias))
            .and_then(|xs| self.config.visible_units.mean(&xs))
            .context(ActivationSnafu)
    }

    /// Sample the hidden units from the visible units.
    ///
    /// Returns the hidden means and sampled states.
    pub fn sample_hidden_from_visible(
        &self,
        visible: &Tensor,
        rng: &mut TensorRng,
    ) -> Result<(Tensor, Tensor), RbmError> {
        let probs = self.hidden_probs(visible)?;
        let states = self
            .config
            .hidden_units
            .sample(&probs, rng)
            .context(SampleSnafu)?;
        Ok((probs, states))
    }

    /// Sample the visible units from the hidden units.
    ///
    /// Returns the visible means and sampled states.
    pub fn sample_visible_from_hidden(
        &self,
        hidden: &Tensor,
        rng: &mut TensorRng,
    ) -> Result<(Tensor, Tensor), RbmError> {
        let probs = self.visible_probs(hidden)?;
        let states = self
            .config
            .visible_units
            .sample(&probs, rng)
            .context(SampleSnafu)?;
        Ok((probs, states))
    }

    /// Run `k` steps of alternating Gibbs sampling starting from `visible`.
    ///
    /// Hidden units are sampled, visible units are represented by their
    /// means.
    pub fn gibbs_sampling(
        &self,
        visible: &Tensor,
        k: usize,
        rng: &mut TensorRng,
    ) -> Result<GibbsSample, RbmError> {
        let (mut hidden_probs, mut hidden_states) = self.sample_hidden_from_visible(visible, rng)?;
        let mut visible = visible.clone();
        for _ in 0..k {
            visible = self.visible_probs(&hidden_states)?;
            (hidden_probs, hidden_states) = self.sample_hidden_from_visible(&visible, rng)?;
        }
        Ok(GibbsSample {
            visible,
            hidden_probs,
            hidden_states,
        })
    }

    /// Estimate the log-likelihood gradients with CD-k.
    pub fn contrastive_divergence(
        &self,
        batch: &Tensor,
        k: usize,
        rng: &mut TensorRng,
    ) -> Result<Gradients, RbmError> {
        let positive_hidden = self.hidden_probs(batch)?;
        let chain = self.gibbs_sampling(batch, k.max(1), rng)?;

        let batch_size = batch.dim(0).context(GradientsSnafu)? as f64;
        let positive = batch
            .t()
            .and_then(|v| v.matmul(&positive_hidden))
            .context(GradientsSnafu)?;
        let negative = chain
            .visible
            .t()
            .and_then(|v| v.matmul(&chain.hidden_probs))
            .context(GradientsSnafu)?;

        Ok(Gradients {
            weights: (positive - negative)
                .and_then(|g| g / batch_size)
                .context(GradientsSnafu)?,
            visible_bias: (batch - &chain.visible)
                .and_then(|g| g.mean(0))
                .context(GradientsSnafu)?,
            hidden_bias: (positive_hidden - &chain.hidden_probs)
                .and_then(|g| g.mean(0))
                .context(GradientsSnafu)?,
        })
    }

    /// Train with mini-batch contrastive divergence.
    ///
    /// * `data` - Training data, *shape:* `(n_samples, visible_width)`.
    /// * `validation` - Data to compute the per-epoch reconstruction error
    ///   on. The training data is used when absent.
    /// * `config` - Training configuration.
    /// * `rng` - Random number generator for shuffling and sampling.
    ///
    /// Returns the reconstruction error per epoch.
    pub fn train(
        &mut self,
        data: &Tensor,
        validation: Option<&Tensor>,
        config: &RbmTrainingConfig,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, RbmError> {
        self.check_input(data)?;
        let n_samples = data.dim(0).context(UpdateSnafu)?;

        let mut weights_velocity = self.weights.zeros_like().context(UpdateSnafu)?;
        let mut visible_velocity = self.visible_bias.zeros_like().context(UpdateSnafu)?;
        let mut hidden_velocity = self.hidden_bias.zeros_like().context(UpdateSnafu)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..config.epochs {
            let learning_rate = config.learning_rate.value(epoch, config.epochs);
            let momentum = config.momentum.value(epoch, config.epochs);

            let batches = batch_indices(n_samples, config.batch_size, Some(&mut *rng), data.device())
                .context(UpdateSnafu)?;
            for indices in batches {
                let batch = select(data, &indices).context(UpdateSnafu)?;
                let gradients = self.contrastive_divergence(&batch, config.gibbs_k, rng)?;

                let weight_gradient = (gradients.weights
                    - (&self.weights * config.weight_cost).context(UpdateSnafu)?)
                .context(UpdateSnafu)?;

                weights_velocity =
                    velocity(&weights_velocity, &weight_gradient, momentum, learning_rate)?;
                visible_velocity = velocity(
                    &visible_velocity,
                    &gradients.visible_bias,
                    momentum,
                    learning_rate,
                )?;
                hidden_velocity = velocity(
                    &hidden_velocity,
                    &gradients.hidden_bias,
                    momentum,
                    learning_rate,
                )?;

                self.weights = (&self.weights + &weights_velocity).context(UpdateSnafu)?;
                self.visible_bias = (&self.visible_bias + &visible_velocity).context(UpdateSnafu)?;
                self.hidden_bias = (&self.hidden_bias + &hidden_velocity).context(UpdateSnafu)?;
            }

            let error = self.reconstruction_error(validation.unwrap_or(data))?;
            tracing::info!(
                epoch,
                learning_rate,
                momentum,
                reconstruction_error = error,
                "RBM ({}, {}) epoch finished",
                self.config.n_visible,
                self.config.n_hidden,
            );
            history.push(error);
        }

        Ok(history)
    }

    /// Mean squared error of a deterministic one-step reconstruction.
    pub fn reconstruction_error(&self, data: &Tensor) -> Result<f64, RbmError> {
        let reconstruction = self.reconstruct(data)?;
        (data - reconstruction)
            .and_then(|d| d.sqr())
            .and_then(|d| d.mean_all())
            .and_then(|d| d.to_dtype(DType::F64))
            .and_then(|d| d.to_scalar::<f64>())
            .context(ReconstructSnafu)
    }

    /// Reconstruct the visible units through the means of the hidden units.
    pub fn reconstruct(&self, data: &Tensor) -> Result<Tensor, RbmError> {
        self.visible_probs(&self.hidden_probs(data)?)
    }

    /// Hidden unit means as learned features.
    pub fn transform(&self, data: &Tensor) -> Result<Tensor, RbmError> {
        self.hidden_probs(data)
    }

    /// Save the configuration and parameters as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RbmError> {
        let path = path.as_ref();
        let checkpoint = RbmCheckpoint {
            config: self.config.clone(),
            weights: self.weights.to_vec2().context(ToVecSnafu)?,
            visible_bias: self.visible_bias.to_vec1().context(ToVecSnafu)?,
            hidden_bias: self.hidden_bias.to_vec1().context(ToVecSnafu)?,
        };
        let file = File::create(path).context(CreateCheckpointSnafu { path })?;
        serde_json::to_writer(BufWriter::new(file), &checkpoint).context(WriteCheckpointSnafu)?;
        tracing::debug!(path = %path.display(), "Saved RBM");
        Ok(())
    }

    /// Load an RBM saved with [`Rbm::save`].
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self, RbmError> {
        let path = path.as_ref();
        let file = File::open(path).context(OpenCheckpointSnafu { path })?;
        let checkpoint: RbmCheckpoint = serde_json::from_reader(BufReader::new(file))
            .context(ParseCheckpointSnafu { path })?;

        let config = checkpoint.config;
        let n_rows = checkpoint.weights.len();
        let n_cols = checkpoint.weights.first().map(Vec::len).unwrap_or(0);
        ensure!(
            n_rows == config.visible_width()
                && checkpoint.weights.iter().all(|row| row.len() == n_cols),
            CheckpointShapeSnafu {
                what: "weights",
                expected: vec![config.visible_width(), config.hidden_width()],
                got: vec![n_rows, n_cols],
            }
        );

        let weights = Tensor::from_vec(
            checkpoint.weights.into_iter().flatten().collect::<Vec<_>>(),
            (n_rows, n_cols),
            device,
        )
        .context(InitializeSnafu)?;
        let visible_bias =
            Tensor::new(checkpoint.visible_bias, device).context(InitializeSnafu)?;
        let hidden_bias = Tensor::new(checkpoint.hidden_bias, device).context(InitializeSnafu)?;

        Self::from_parameters(config, weights, visible_bias, hidden_bias)
    }

    fn check_input(&self, xs: &Tensor) -> Result<(), RbmError> {
        let got = xs.dims().last().copied().unwrap_or(0);
        let expected = self.config.visible_width();
        ensure!(got == expected, InputWidthSnafu { expected, got });
        Ok(())
    }
}

/// `momentum * velocity + learning_rate * gradient`
fn velocity(
    velocity: &Tensor,
    gradient: &Tensor,
    momentum: f64,
    learning_rate: f64,
) -> Result<Tensor, RbmError> {
    (velocity * momentum)
        .and_then(|v| v + (gradient * learning_rate)?)
        .context(UpdateSnafu)
}

fn check_shape(what: &'static str, tensor: &Tensor, expected: &[usize]) -> Result<(), RbmError> {
    ensure!(
        tensor.dims() == expected,
        CheckpointShapeSnafu {
            what,
            expected: expected.to_vec(),
            got: tensor.dims().to_vec(),
        }
    );
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct RbmCheckpoint {
    config: RbmConfig,
    weights: Vec<Vec<f32>>,
    visible_bias: Vec<f32>,
    hidden_bias: Vec<f32>,
}
