use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::data::batches::{batch_indices, select};
use crate::data::Corruption;
use crate::layers::Activation;
use crate::training::metrics::mean;
use crate::training::{Loss, OptimizerKind, TrainingHistory};
use crate::util::rng::TensorRng;

/// Denoising autoencoder errors.
#[derive(Debug, Snafu)]
pub enum DenoisingAutoencoderError {
    #[snafu(display("Cannot construct optimizer"))]
    BuildOptimizer { source: candle_core::Error },

    #[snafu(display("Cannot compute reconstruction cost"))]
    Cost { source: candle_core::Error },

    #[snafu(display("Cannot encode or decode input"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Cannot initialize parameters"))]
    Initialize { source: candle_core::Error },

    #[snafu(display("Input has {got} columns, expected {expected}"))]
    InputWidth { expected: usize, got: usize },

    #[snafu(display("{loss:?} is not a reconstruction loss"))]
    ReconstructionLoss { loss: Loss },

    #[snafu(display("Cannot load parameters: {}", path.to_string_lossy()))]
    Load {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot save parameters: {}", path.to_string_lossy()))]
    Save {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("Training step failed"))]
    TrainStep { source: candle_core::Error },
}

/// Denoising autoencoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoisingAutoencoderConfig {
    batch_size: usize,
    corruption: Corruption,
    dec_activation: Activation,
    enc_activation: Activation,
    epochs: usize,
    l2: f64,
    learning_rate: f64,
    loss: Loss,
    momentum: f64,
    n_components: usize,
    optimizer: OptimizerKind,
}

impl DenoisingAutoencoderConfig {
    /// Mini-batch size.
    ///
    /// Default: `10`
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Input corruption.
    ///
    /// Default: `Corruption::None`
    pub fn corruption(mut self, corruption: Corruption) -> Self {
        self.corruption = corruption;
        self
    }

    /// Decoder activation.
    ///
    /// Default: `Activation::Sigmoid`
    pub fn dec_activation(mut self, dec_activation: Activation) -> Self {
        self.dec_activation = dec_activation;
        self
    }

    /// Encoder activation.
    ///
    /// Default: `Activation::Sigmoid`
    pub fn enc_activation(mut self, enc_activation: Activation) -> Self {
        self.enc_activation = enc_activation;
        self
    }

    /// Number of training epochs.
    ///
    /// Default: `10`
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// L2 penalty on the weights.
    ///
    /// Default: `5e-4`
    pub fn l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    /// Learning rate.
    ///
    /// Default: `0.01`
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Reconstruction loss.
    ///
    /// Default: `Loss::CrossEntropy`
    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    /// Momentum, used by the momentum optimizer.
    ///
    /// Default: `0.5`
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Number of hidden units.
    ///
    /// Default: `256`
    pub fn n_components(mut self, n_components: usize) -> Self {
        self.n_components = n_components;
        self
    }

    /// Optimizer.
    ///
    /// Default: `OptimizerKind::GradientDescent`
    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Get the mini-batch size.
    pub fn get_batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get the number of hidden units.
    pub fn get_n_components(&self) -> usize {
        self.n_components
    }

    /// Build an autoencoder for inputs with `n_features` columns.
    ///
    /// Weights are drawn from the uniform distribution of Glorot and Bengio
    /// (2010), scaled by 4 for sigmoid encoders. Biases start at zero.
    pub fn build(
        &self,
        n_features: usize,
        device: &Device,
    ) -> Result<DenoisingAutoencoder, DenoisingAutoencoderError> {
        ensure!(
            matches!(self.loss, Loss::CrossEntropy | Loss::MeanSquared),
            ReconstructionLossSnafu { loss: self.loss }
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut bound = (6. / (n_features + self.n_components) as f64).sqrt();
        if self.enc_activation == Activation::Sigmoid {
            bound *= 4.;
        }

        let weight = vb
            .get_with_hints(
                (n_features, self.n_components),
                "weight",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )
            .context(InitializeSnafu)?;
        let encoder_bias = vb
            .get_with_hints(self.n_components, "encoder_bias", Init::Const(0.))
            .context(InitializeSnafu)?;
        let decoder_bias = vb
            .get_with_hints(n_features, "decoder_bias", Init::Const(0.))
            .context(InitializeSnafu)?;

        Ok(DenoisingAutoencoder {
            config: self.clone(),
            decoder_bias,
            encoder_bias,
            n_features,
            varmap,
            weight,
        })
    }
}

impl Default for DenoisingAutoencoderConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            corruption: Corruption::None,
            dec_activation: Activation::Sigmoid,
            enc_activation: Activation::Sigmoid,
            epochs: 10,
            l2: 5e-4,
            learning_rate: 0.01,
            loss: Loss::CrossEntropy,
            momentum: 0.5,
            n_components: 256,
            optimizer: OptimizerKind::GradientDescent,
        }
    }
}

/// Denoising autoencoder with tied weights.
///
/// The encoder computes `enc_activation(x · W + b_enc)`, the decoder
/// `dec_activation(h · Wᵀ + b_dec)`. During training the input is corrupted
/// and the autoencoder learns to reconstruct the clean input.
///
/// See [Extracting and Composing Robust Features with Denoising Autoencoders](https://www.cs.toronto.edu/~larocheh/publications/icml-2008-denoising-autoencoders.pdf).
pub struct DenoisingAutoencoder {
    config: DenoisingAutoencoderConfig,
    decoder_bias: Tensor,
    encoder_bias: Tensor,
    n_features: usize,
    varmap: VarMap,
    weight: Tensor,
}

impl DenoisingAutoencoder {
    /// Autoencoder configuration.
    pub fn config(&self) -> &DenoisingAutoencoderConfig {
        &self.config
    }

    /// Train the autoencoder.
    ///
    /// * `data` - Training data, *shape:* `(n_samples, n_features)`.
    /// * `validation` - Data to compute the per-epoch cost on. The mean
    ///   training cost is recorded when absent.
    pub fn fit(
        &mut self,
        data: &Tensor,
        validation: Option<&Tensor>,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, DenoisingAutoencoderError> {
        self.check_input(data)?;
        let n_samples = data.dim(0).context(TrainStepSnafu)?;

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
                data.device(),
            )
            .context(TrainStepSnafu)?;

            let mut costs = Vec::with_capacity(batches.len());
            for indices in batches {
                let batch = select(data, &indices).context(TrainStepSnafu)?;
                let corrupted = self
                    .config
                    .corruption
                    .apply(&batch, rng)
                    .context(TrainStepSnafu)?;
                let cost = self
                    .regularized_cost(&corrupted, &batch)
                    .context(TrainStepSnafu)?;
                optimizer.backward_step(&cost).context(TrainStepSnafu)?;
                costs.push(scalar(&cost).context(TrainStepSnafu)?);
            }

            let cost = match validation {
                Some(validation) => self.cost(validation)?,
                None => mean(&costs),
            };
            tracing::info!(
                epoch,
                cost,
                n_components = self.config.n_components,
                "Denoising autoencoder epoch finished"
            );
            history.push(cost);
        }

        Ok(history)
    }

    /// Encode the input, *shape:* `(n_samples, n_components)`.
    pub fn transform(&self, xs: &Tensor) -> Result<Tensor, DenoisingAutoencoderError> {
        self.check_input(xs)?;
        self.encode(xs).context(ForwardSnafu)
    }

    /// Reconstruct the input through the hidden representation.
    pub fn reconstruct(&self, xs: &Tensor) -> Result<Tensor, DenoisingAutoencoderError> {
        self.check_input(xs)?;
        self.encode(xs)
            .and_then(|hidden| self.decode(&hidden))
            .context(ForwardSnafu)
    }

    /// Reconstruction cost of uncorrupted data, without regularization.
    pub fn cost(&self, xs: &Tensor) -> Result<f64, DenoisingAutoencoderError> {
        self.check_input(xs)?;
        self.encode(xs)
            .and_then(|hidden| self.decode(&hidden))
            .and_then(|reconstruction| self.config.loss.compute(&reconstruction, xs))
            .and_then(|cost| scalar(&cost))
            .context(CostSnafu)
    }

    /// Encoder weights `(n_features, n_components)` and bias.
    pub fn parameters(&self) -> (Tensor, Tensor) {
        (self.weight.detach(), self.encoder_bias.detach())
    }

    /// Save the parameters in safetensors format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DenoisingAutoencoderError> {
        let path = path.as_ref();
        self.varmap.save(path).context(SaveSnafu { path })
    }

    /// Load an autoencoder saved with [`DenoisingAutoencoder::save`].
    pub fn load(
        path: impl AsRef<Path>,
        config: &DenoisingAutoencoderConfig,
        n_features: usize,
        device: &Device,
    ) -> Result<Self, DenoisingAutoencoderError> {
        let path = path.as_ref();
        let mut autoencoder = config.build(n_features, device)?;
        autoencoder.varmap.load(path).context(LoadSnafu { path })?;
        Ok(autoencoder)
    }

    fn encode(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        self.config
            .enc_activation
            .forward(&xs.matmul(&self.weight)?.broadcast_add(&self.encoder_bias)?)
    }

    fn decode(&self, hidden: &Tensor) -> Result<Tensor, candle_core::Error> {
        self.config
            .dec_activation
            .forward(&hidden.matmul(&self.weight.t()?)?.broadcast_add(&self.decoder_bias)?)
    }

    fn regularized_cost(
        &self,
        corrupted: &Tensor,
        clean: &Tensor,
    ) -> Result<Tensor, candle_core::Error> {
        let reconstruction = self.decode(&self.encode(corrupted)?)?;
        let cost = self.config.loss.compute(&reconstruction, clean)?;
        if self.config.l2 > 0. {
            cost + (self.weight.sqr()?.sum_all()? * (self.config.l2 / 2.))?
        } else {
            Ok(cost)
        }
    }

    fn check_input(&self, xs: &Tensor) -> Result<(), DenoisingAutoencoderError> {
        let got = xs.dims().last().copied().unwrap_or(0);
        ensure!(
            got == self.n_features,
            InputWidthSnafu {
                expected: self.n_features,
                got
            }
        );
        Ok(())
    }
}

fn scalar(t: &Tensor) -> Result<f64, candle_core::Error> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use rstest::rstest;

    use super::{DenoisingAutoencoderConfig, DenoisingAutoencoderError};
    use crate::data::Corruption;
    use crate::layers::Activation;
    use crate::models::rbm::tests::binary_patterns;
    use crate::training::{Loss, OptimizerKind};
    use crate::util::rng::TensorRng;

    fn config() -> DenoisingAutoencoderConfig {
        DenoisingAutoencoderConfig::default()
            .n_components(4)
            .epochs(30)
            .learning_rate(0.1)
            .optimizer(OptimizerKind::Momentum)
    }

    #[rstest]
    #[case(Corruption::None, Loss::CrossEntropy, Activation::Sigmoid)]
    #[case(Corruption::Masking(0.2), Loss::CrossEntropy, Activation::Tanh)]
    #[case(Corruption::SaltAndPepper(0.1), Loss::MeanSquared, Activation::Relu)]
    fn training_reduces_cost(
        #[case] corruption: Corruption,
        #[case] loss: Loss,
        #[case] enc_activation: Activation,
    ) {
        let mut rng = TensorRng::seed_from_u64(9);
        let data = binary_patterns(100, &mut rng);
        let mut dae = config()
            .corruption(corruption)
            .loss(loss)
            .enc_activation(enc_activation)
            .build(8, &Device::Cpu)
            .unwrap();
        let before = dae.cost(&data).unwrap();
        let history = dae.fit(&data, Some(&data), &mut rng).unwrap();
        assert_eq!(history.errors().len(), 30);
        let after = history.last().unwrap();
        assert!(after < before, "cost went from {before} to {after}");
    }

    #[test]
    fn rejects_classification_loss() {
        assert!(matches!(
            config()
                .loss(Loss::SoftmaxCrossEntropy)
                .build(8, &Device::Cpu),
            Err(DenoisingAutoencoderError::ReconstructionLoss {
                loss: Loss::SoftmaxCrossEntropy
            })
        ));
    }

    #[test]
    fn encodes_and_reconstructs() {
        let dae = config().build(8, &Device::Cpu).unwrap();
        let xs = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(dae.transform(&xs).unwrap().dims(), &[3, 4]);
        assert_eq!(dae.reconstruct(&xs).unwrap().dims(), &[3, 8]);

        let (weight, bias) = dae.parameters();
        assert_eq!(weight.dims(), &[8, 4]);
        assert_eq!(bias.dims(), &[4]);

        let xs = Tensor::ones((3, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            dae.transform(&xs),
            Err(DenoisingAutoencoderError::InputWidth {
                expected: 8,
                got: 7
            })
        ));
    }

    #[test]
    fn save_and_load() {
        let mut rng = TensorRng::seed_from_u64(9);
        let data = binary_patterns(20, &mut rng);
        let mut dae = config().epochs(2).build(8, &Device::Cpu).unwrap();
        dae.fit(&data, None, &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dae.safetensors");
        dae.save(&path).unwrap();

        let loaded = super::DenoisingAutoencoder::load(&path, dae.config(), 8, &Device::Cpu)
            .unwrap();
        assert_eq!(
            loaded.transform(&data).unwrap().to_vec2::<f32>().unwrap(),
            dae.transform(&data).unwrap().to_vec2::<f32>().unwrap()
        );
    }
}
