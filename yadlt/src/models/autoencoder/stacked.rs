use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::denoising::{DenoisingAutoencoderConfig, DenoisingAutoencoderError};
use crate::data::batches::{batch_indices, select};
use crate::data::preprocess::one_hot;
use crate::data::Corruption;
use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::Activation;
use crate::training::metrics::mean;
use crate::training::{accuracy, Loss, MetricsError, OptimizerKind, TrainingHistory};
use crate::util::rng::TensorRng;
use crate::util::tensor_ext::ArgmaxRows;

/// Stacked denoising autoencoder errors.
#[derive(Debug, Snafu)]
pub enum StackedDenoisingAutoencoderError {
    #[snafu(display("Cannot compute accuracy"))]
    Accuracy { source: MetricsError },

    #[snafu(display("Cannot build dropout module"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct optimizer"))]
    BuildOptimizer { source: candle_core::Error },

    #[snafu(display("A stacked autoencoder needs at least one layer"))]
    EmptyLayers,

    #[snafu(display("Cannot apply network"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Cannot initialize parameters"))]
    Initialize { source: candle_core::Error },

    #[snafu(display("Got {n_samples} samples, but {n_labels} labels"))]
    LabelCount { n_samples: usize, n_labels: usize },

    #[snafu(display("Cannot load parameters: {}", path.to_string_lossy()))]
    Load {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("The network has not been fine-tuned"))]
    NotFitted,

    #[snafu(display("Cannot pretrain layer {layer}"))]
    Pretrain {
        source: DenoisingAutoencoderError,
        layer: usize,
    },

    #[snafu(display("Cannot save parameters: {}", path.to_string_lossy()))]
    Save {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("Fine-tuning step failed"))]
    TrainStep { source: candle_core::Error },
}

/// Per-layer denoising autoencoder parameters.
///
/// Every list holds one value per layer. A list whose length differs from
/// the number of layers is broadcast from its first element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaeLayerParams {
    pub batch_size: Vec<usize>,
    pub corruption: Vec<Corruption>,
    pub dec_activation: Vec<Activation>,
    pub enc_activation: Vec<Activation>,
    pub epochs: Vec<usize>,
    pub l2: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub loss: Vec<Loss>,
    pub momentum: f64,
    pub optimizer: Vec<OptimizerKind>,
}

impl Default for DaeLayerParams {
    fn default() -> Self {
        Self {
            batch_size: vec![10],
            corruption: vec![Corruption::None],
            dec_activation: vec![Activation::Sigmoid],
            enc_activation: vec![Activation::Tanh],
            epochs: vec![10],
            l2: vec![5e-4],
            learning_rate: vec![0.01],
            loss: vec![Loss::CrossEntropy],
            momentum: 0.5,
            optimizer: vec![OptimizerKind::GradientDescent],
        }
    }
}

fn broadcast<T: Copy>(values: &[T], layer: usize, n_layers: usize, default: T) -> T {
    if values.len() == n_layers {
        values[layer]
    } else {
        values.first().copied().unwrap_or(default)
    }
}

impl DaeLayerParams {
    /// Configuration of the autoencoder of `layer`.
    pub fn layer_config(&self, layer: usize, layers: &[usize]) -> DenoisingAutoencoderConfig {
        let n = layers.len();
        let default = Self::default();
        DenoisingAutoencoderConfig::default()
            .n_components(layers[layer])
            .batch_size(broadcast(&self.batch_size, layer, n, default.batch_size[0]))
            .corruption(broadcast(&self.corruption, layer, n, Corruption::None))
            .dec_activation(broadcast(
                &self.dec_activation,
                layer,
                n,
                default.dec_activation[0],
            ))
            .enc_activation(broadcast(
                &self.enc_activation,
                layer,
                n,
                default.enc_activation[0],
            ))
            .epochs(broadcast(&self.epochs, layer, n, default.epochs[0]))
            .l2(broadcast(&self.l2, layer, n, default.l2[0]))
            .learning_rate(broadcast(
                &self.learning_rate,
                layer,
                n,
                default.learning_rate[0],
            ))
            .loss(broadcast(&self.loss, layer, n, default.loss[0]))
            .optimizer(broadcast(
                &self.optimizer,
                layer,
                n,
                default.optimizer[0],
            ))
            .momentum(self.momentum)
    }
}

/// Supervised fine-tuning configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub activation: Activation,
    pub batch_size: usize,
    pub dropout: DropoutConfig,
    pub epochs: usize,
    pub learning_rate: f64,
    pub loss: Loss,
    pub momentum: f64,
    pub optimizer: OptimizerKind,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            batch_size: 20,
            dropout: DropoutConfig::default(),
            epochs: 10,
            learning_rate: 0.001,
            loss: Loss::SoftmaxCrossEntropy,
            momentum: 0.5,
            optimizer: OptimizerKind::GradientDescent,
        }
    }
}

/// Stacked denoising autoencoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackedDenoisingAutoencoderConfig {
    dae: DaeLayerParams,
    finetune: FineTuneConfig,
    layers: Vec<usize>,
}

impl StackedDenoisingAutoencoderConfig {
    /// Per-layer autoencoder parameters.
    ///
    /// Default: `DaeLayerParams::default()`
    pub fn dae(mut self, dae: DaeLayerParams) -> Self {
        self.dae = dae;
        self
    }

    /// Fine-tuning parameters.
    ///
    /// Default: `FineTuneConfig::default()`
    pub fn finetune(mut self, finetune: FineTuneConfig) -> Self {
        self.finetune = finetune;
        self
    }

    /// Hidden units of every encoding layer.
    ///
    /// Default: `[256]`
    pub fn layers(mut self, layers: Vec<usize>) -> Self {
        self.layers = layers;
        self
    }

    /// Get the fine-tuning parameters.
    pub fn get_finetune(&self) -> &FineTuneConfig {
        &self.finetune
    }

    /// Build an untrained stacked autoencoder.
    pub fn build(&self) -> Result<StackedDenoisingAutoencoder, StackedDenoisingAutoencoderError> {
        ensure!(!self.layers.is_empty(), EmptyLayersSnafu);
        Ok(StackedDenoisingAutoencoder {
            config: self.clone(),
            network: None,
            pretrained: Vec::new(),
        })
    }
}

impl Default for StackedDenoisingAutoencoderConfig {
    fn default() -> Self {
        Self {
            dae: DaeLayerParams::default(),
            finetune: FineTuneConfig::default(),
            layers: vec![256],
        }
    }
}

/// Encoding layers plus softmax layer.
struct Network {
    activation: Activation,
    dropout: Box<dyn ModuleT>,
    layers: Vec<Linear>,
    output: Linear,
    varmap: VarMap,
}

impl Network {
    /// Logits of the softmax layer.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let mut hidden = xs.clone();
        for layer in &self.layers {
            hidden = self.activation.forward(&layer.forward(&hidden)?)?;
            hidden = self.dropout.forward_t(&hidden, train)?;
        }
        self.output.forward(&hidden)
    }
}

/// Stacked denoising autoencoder for classification.
///
/// Denoising autoencoders are pretrained greedily, then their encoders are
/// fine-tuned together with a softmax layer.
///
/// See [Stacked Denoising Autoencoders](https://www.jmlr.org/papers/volume11/vincent10a/vincent10a.pdf).
pub struct StackedDenoisingAutoencoder {
    config: StackedDenoisingAutoencoderConfig,
    network: Option<Network>,
    /// Pretrained encoder weights `(n_in, n_out)` and biases.
    pretrained: Vec<(Tensor, Tensor)>,
}

impl StackedDenoisingAutoencoder {
    /// Model configuration.
    pub fn config(&self) -> &StackedDenoisingAutoencoderConfig {
        &self.config
    }

    /// Whether the encoders were pretrained.
    pub fn is_pretrained(&self) -> bool {
        self.pretrained.len() == self.config.layers.len()
    }

    /// Greedy layer-wise pretraining.
    ///
    /// Every autoencoder is trained on the encoding of the previous one.
    /// Returns the cost history of every layer.
    pub fn pretrain(
        &mut self,
        data: &Tensor,
        validation: Option<&Tensor>,
        rng: &mut TensorRng,
    ) -> Result<Vec<TrainingHistory>, StackedDenoisingAutoencoderError> {
        let mut layer_input = data.clone();
        let mut layer_validation = validation.cloned();
        let mut histories = Vec::with_capacity(self.config.layers.len());
        let mut pretrained = Vec::with_capacity(self.config.layers.len());

        for layer in 0..self.config.layers.len() {
            let n_features = layer_input.dim(1).context(InitializeSnafu)?;
            let layer_config = self.config.dae.layer_config(layer, &self.config.layers);
            tracing::info!(
                layer,
                n_features,
                n_components = layer_config.get_n_components(),
                "Pretraining denoising autoencoder"
            );

            let mut dae = layer_config
                .build(n_features, data.device())
                .context(PretrainSnafu { layer })?;
            histories.push(
                dae.fit(&layer_input, layer_validation.as_ref(), rng)
                    .context(PretrainSnafu { layer })?,
            );
            pretrained.push(dae.parameters());

            layer_input = dae
                .transform(&layer_input)
                .context(PretrainSnafu { layer })?;
            layer_validation = layer_validation
                .map(|validation| dae.transform(&validation))
                .transpose()
                .context(PretrainSnafu { layer })?;
        }

        self.pretrained = pretrained;
        Ok(histories)
    }

    /// Fine-tune the encoders and a softmax layer.
    ///
    /// The encoders start from the pretrained parameters when
    /// [`StackedDenoisingAutoencoder::pretrain`] was run, otherwise from
    /// N(0, 0.1²) weights and 0.1 biases.
    ///
    /// * `labels` - Class indices, *shape:* `(n_samples,)`, `u32`.
    /// * `validation` - Validation data and labels, the accuracy on them
    ///   is logged every epoch.
    ///
    /// Returns the mean training cost per epoch.
    pub fn fit(
        &mut self,
        data: &Tensor,
        labels: &Tensor,
        validation: Option<(&Tensor, &Tensor)>,
        n_classes: usize,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, StackedDenoisingAutoencoderError> {
        let n_samples = data.dim(0).context(TrainStepSnafu)?;
        let n_labels = labels.dim(0).context(TrainStepSnafu)?;
        ensure!(
            n_samples == n_labels,
            LabelCountSnafu {
                n_samples,
                n_labels
            }
        );

        let n_features = data.dim(1).context(InitializeSnafu)?;
        let pretrained = self.is_pretrained().then_some(self.pretrained.as_slice());
        let network = self.build_network(n_features, n_classes, pretrained, data.device())?;
        let finetune = &self.config.finetune;

        let mut optimizer = finetune
            .optimizer
            .build(
                network.varmap.all_vars(),
                finetune.learning_rate,
                finetune.momentum,
            )
            .context(BuildOptimizerSnafu)?;
        let targets = one_hot(labels, n_classes).context(TrainStepSnafu)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..finetune.epochs {
            let batches = batch_indices(
                n_samples,
                finetune.batch_size,
                Some(&mut *rng),
                data.device(),
            )
            .context(TrainStepSnafu)?;

            let mut costs = Vec::with_capacity(batches.len());
            for indices in batches {
                let cost = (|| {
                    let xs = select(data, &indices)?;
                    let ys = select(&targets, &indices)?;
                    let logits = network.forward_t(&xs, true)?;
                    let cost = match finetune.loss {
                        Loss::MeanSquared => Loss::MeanSquared
                            .compute(&candle_nn::ops::softmax_last_dim(&logits)?, &ys)?,
                        loss => loss.compute(&logits, &ys)?,
                    };
                    optimizer.backward_step(&cost)?;
                    cost.to_dtype(DType::F64)?.to_scalar::<f64>()
                })()
                .context(TrainStepSnafu)?;
                costs.push(cost);
            }

            let cost = mean(&costs);
            match validation {
                Some((validation, validation_labels)) => {
                    let accuracy = network
                        .forward_t(validation, false)
                        .and_then(|logits| logits.argmax_rows())
                        .context(ForwardSnafu)
                        .and_then(|predictions| {
                            accuracy(&predictions, validation_labels).context(AccuracySnafu)
                        })?;
                    tracing::info!(epoch, cost, accuracy, "Fine-tuning epoch finished");
                }
                None => tracing::info!(epoch, cost, "Fine-tuning epoch finished"),
            }
            history.push(cost);
        }

        self.network = Some(network);
        Ok(history)
    }

    /// Class probabilities, *shape:* `(n_samples, n_classes)`.
    pub fn predict_proba(&self, xs: &Tensor) -> Result<Tensor, StackedDenoisingAutoencoderError> {
        let network = self.network.as_ref().context(NotFittedSnafu)?;
        network
            .forward_t(xs, false)
            .and_then(|logits| candle_nn::ops::softmax_last_dim(&logits))
            .context(ForwardSnafu)
    }

    /// Most probable class per sample, `u32`.
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor, StackedDenoisingAutoencoderError> {
        let network = self.network.as_ref().context(NotFittedSnafu)?;
        network
            .forward_t(xs, false)
            .and_then(|logits| logits.argmax_rows())
            .context(ForwardSnafu)
    }

    /// Mean accuracy on the given samples.
    pub fn score(
        &self,
        xs: &Tensor,
        labels: &Tensor,
    ) -> Result<f32, StackedDenoisingAutoencoderError> {
        accuracy(&self.predict(xs)?, labels).context(AccuracySnafu)
    }

    /// Save the fine-tuned network in safetensors format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StackedDenoisingAutoencoderError> {
        let path = path.as_ref();
        let network = self.network.as_ref().context(NotFittedSnafu)?;
        network.varmap.save(path).context(SaveSnafu { path })
    }

    /// Load a network saved with [`StackedDenoisingAutoencoder::save`].
    pub fn load(
        path: impl AsRef<Path>,
        config: &StackedDenoisingAutoencoderConfig,
        n_features: usize,
        n_classes: usize,
        device: &Device,
    ) -> Result<Self, StackedDenoisingAutoencoderError> {
        let path = path.as_ref();
        let mut sdae = config.build()?;
        let mut network = sdae.build_network(n_features, n_classes, None, device)?;
        network.varmap.load(path).context(LoadSnafu { path })?;
        sdae.network = Some(network);
        Ok(sdae)
    }

    fn build_network(
        &self,
        n_features: usize,
        n_classes: usize,
        pretrained: Option<&[(Tensor, Tensor)]>,
        device: &Device,
    ) -> Result<Network, StackedDenoisingAutoencoderError> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let weight_init = Init::Randn {
            mean: 0.,
            stdev: 0.1,
        };
        let bias_init = Init::Const(0.1);

        let mut layers = Vec::with_capacity(self.config.layers.len());
        let mut n_in = n_features;
        for (layer, &n_out) in self.config.layers.iter().enumerate() {
            let weight_name = format!("encoder_{layer}.weight");
            let bias_name = format!("encoder_{layer}.bias");
            let weight = vb
                .get_with_hints((n_out, n_in), &weight_name, weight_init)
                .context(InitializeSnafu)?;
            let bias = vb
                .get_with_hints(n_out, &bias_name, bias_init)
                .context(InitializeSnafu)?;

            if let Some((pretrained_weight, pretrained_bias)) =
                pretrained.and_then(|pretrained| pretrained.get(layer))
            {
                // Linear layers store the transposed weight matrix.
                let pretrained_weight = pretrained_weight
                    .t()
                    .and_then(|w| w.contiguous())
                    .context(InitializeSnafu)?;
                varmap
                    .set_one(&weight_name, pretrained_weight)
                    .context(InitializeSnafu)?;
                varmap
                    .set_one(&bias_name, pretrained_bias)
                    .context(InitializeSnafu)?;
            }

            layers.push(Linear::new(weight, Some(bias)));
            n_in = n_out;
        }

        let output = Linear::new(
            vb.get_with_hints((n_classes, n_in), "softmax.weight", weight_init)
                .context(InitializeSnafu)?,
            Some(
                vb.get_with_hints(n_classes, "softmax.bias", bias_init)
                    .context(InitializeSnafu)?,
            ),
        );

        let dropout = self
            .config
            .finetune
            .dropout
            .build(vb.push_prefix("dropout"))
            .context(BuildDropoutSnafu)?;

        Ok(Network {
            activation: self.config.finetune.activation,
            dropout,
            layers,
            output,
            varmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use rstest::rstest;

    use super::{
        DaeLayerParams, FineTuneConfig, StackedDenoisingAutoencoder,
        StackedDenoisingAutoencoderConfig, StackedDenoisingAutoencoderError,
    };
    use crate::data::Corruption;
    use crate::layers::dropout::DropoutConfig;
    use crate::layers::Activation;
    use crate::models::dbn::tests::labelled_patterns;
    use crate::training::{Loss, OptimizerKind};
    use crate::util::rng::TensorRng;

    fn config() -> StackedDenoisingAutoencoderConfig {
        StackedDenoisingAutoencoderConfig::default()
            .layers(vec![6, 4])
            .dae(DaeLayerParams {
                enc_activation: vec![Activation::Sigmoid],
                epochs: vec![5, 3],
                learning_rate: vec![0.1],
                corruption: vec![Corruption::Masking(0.1)],
                ..Default::default()
            })
            .finetune(FineTuneConfig {
                activation: Activation::Sigmoid,
                batch_size: 10,
                epochs: 60,
                learning_rate: 0.5,
                optimizer: OptimizerKind::Momentum,
                ..Default::default()
            })
    }

    #[test]
    fn broadcasts_short_parameter_lists() {
        let params = DaeLayerParams {
            epochs: vec![5, 3],
            learning_rate: vec![0.1],
            loss: vec![Loss::MeanSquared, Loss::CrossEntropy, Loss::MeanSquared],
            ..Default::default()
        };
        let layers = [6, 4];
        assert_eq!(
            params.layer_config(1, &layers),
            crate::models::autoencoder::DenoisingAutoencoderConfig::default()
                .n_components(4)
                .epochs(3)
                .learning_rate(0.1)
                .enc_activation(Activation::Tanh)
                .loss(Loss::MeanSquared)
        );
    }

    #[test]
    fn default_layers_decode_into_unit_interval() {
        // Cross-entropy needs decoder outputs in (0, 1).
        assert_eq!(
            DaeLayerParams::default().dec_activation,
            vec![Activation::Sigmoid]
        );

        let mut rng = TensorRng::seed_from_u64(4);
        let (data, _) = labelled_patterns(40, &mut rng);
        let mut sdae = StackedDenoisingAutoencoderConfig::default()
            .layers(vec![6, 4])
            .dae(DaeLayerParams {
                epochs: vec![2],
                ..Default::default()
            })
            .build()
            .unwrap();
        let histories = sdae.pretrain(&data, Some(&data), &mut rng).unwrap();
        for history in histories {
            assert!(history.errors().iter().all(|e| e.is_finite()));
        }
    }

    #[test]
    fn rejects_empty_layers() {
        assert!(matches!(
            StackedDenoisingAutoencoderConfig::default()
                .layers(vec![])
                .build(),
            Err(StackedDenoisingAutoencoderError::EmptyLayers)
        ));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn fine_tunes_with_and_without_pretraining(#[case] pretrain: bool) {
        let mut rng = TensorRng::seed_from_u64(21);
        let (data, labels) = labelled_patterns(60, &mut rng);
        let mut sdae = config().build().unwrap();

        assert!(matches!(
            sdae.predict(&data),
            Err(StackedDenoisingAutoencoderError::NotFitted)
        ));

        if pretrain {
            let histories = sdae.pretrain(&data, Some(&data), &mut rng).unwrap();
            assert_eq!(histories.len(), 2);
            assert_eq!(histories[0].errors().len(), 5);
            assert_eq!(histories[1].errors().len(), 3);
        }
        assert_eq!(sdae.is_pretrained(), pretrain);

        let history = sdae
            .fit(&data, &labels, Some((&data, &labels)), 2, &mut rng)
            .unwrap();
        assert_eq!(history.errors().len(), 60);
        let accuracy = sdae.score(&data, &labels).unwrap();
        assert!(accuracy > 0.9, "accuracy: {accuracy}");

        let probs = sdae.predict_proba(&data).unwrap();
        assert_eq!(probs.dims(), &[60, 2]);
    }

    #[test]
    fn dropout_and_mean_squared_loss() {
        let mut rng = TensorRng::seed_from_u64(21);
        let (data, labels) = labelled_patterns(20, &mut rng);
        let mut sdae = config()
            .finetune(FineTuneConfig {
                dropout: DropoutConfig::default().keep_prob(0.8),
                loss: Loss::MeanSquared,
                epochs: 2,
                ..Default::default()
            })
            .build()
            .unwrap();
        let history = sdae.fit(&data, &labels, None, 2, &mut rng).unwrap();
        assert!(history.errors().iter().all(|e| e.is_finite()));
    }

    #[test]
    fn save_and_load() {
        let mut rng = TensorRng::seed_from_u64(21);
        let (data, labels) = labelled_patterns(20, &mut rng);
        let mut sdae = config().build().unwrap();
        sdae.fit(&data, &labels, None, 2, &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdae.safetensors");
        sdae.save(&path).unwrap();

        let loaded =
            StackedDenoisingAutoencoder::load(&path, sdae.config(), 8, 2, &Device::Cpu).unwrap();
        assert_eq!(
            loaded.predict_proba(&data).unwrap().to_vec2::<f32>().unwrap(),
            sdae.predict_proba(&data).unwrap().to_vec2::<f32>().unwrap()
        );
    }
}
