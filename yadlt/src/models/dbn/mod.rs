//! Deep belief networks.
//!
//! A DBN is a stack of RBMs that is pretrained greedily, one layer at a
//! time (Hinton et al., 2006). The pretrained stack can be fine-tuned for
//! classification in three ways:
//!
//! * a logistic regression layer on the last representation
//!   ([`Dbn::fit_cls`]);
//! * the up-down (wake-sleep) algorithm with a top-level associative
//!   memory over the penultimate representation and the labels
//!   ([`Dbn::wake_sleep`]);
//! * backpropagation through the stack and a softmax output layer
//!   ([`Dbn::backprop`]).
//!
//! See [A Fast Learning Algorithm for Deep Belief Nets](https://www.cs.toronto.edu/~hinton/absps/fastnc.pdf).
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::models::logistic::{
    LogisticRegression, LogisticRegressionConfig, LogisticRegressionError,
};
use crate::models::rbm::{Rbm, RbmConfig, RbmError, RbmTrainingConfig};
use crate::training::{MetricsError, TrainingHistory};
use crate::util::rng::TensorRng;

mod backprop;
pub use backprop::BackpropConfig;
use backprop::SoftmaxOutput;

mod wake_sleep;
pub use wake_sleep::WakeSleepConfig;
use wake_sleep::WakeSleepState;

/// DBN errors.
#[derive(Debug, Snafu)]
pub enum DbnError {
    #[snafu(display("Wake-sleep requires exactly 2 RBM layers, the network has {n_layers}"))]
    Architecture { n_layers: usize },

    #[snafu(display("Backpropagation fine-tuning failed"))]
    Backprop { source: candle_core::Error },

    #[snafu(display("Cannot build RBM for layer {layer}"))]
    BuildRbm { source: RbmError, layer: usize },

    #[snafu(display("Logistic regression layer failed"))]
    Classifier { source: LogisticRegressionError },

    #[snafu(display("A deep belief network needs at least one RBM"))]
    EmptyLayers,

    #[snafu(display("Cannot generate a fantasy"))]
    Fantasy { source: RbmError },

    #[snafu(display("Cannot propagate through layer {layer}"))]
    Forward { source: RbmError, layer: usize },

    #[snafu(display("Got {n_samples} samples, but {n_labels} labels"))]
    LabelCount { n_samples: usize, n_labels: usize },

    #[snafu(display(
        "Layer {layer} has {got} visible columns, but the previous layer has {expected} hidden columns"
    ))]
    LayerMismatch {
        layer: usize,
        expected: usize,
        got: usize,
    },

    #[snafu(display("Cannot load RBM: {}", path.to_string_lossy()))]
    LoadRbm { source: RbmError, path: PathBuf },

    #[snafu(display("{step} fine-tuning has not been performed"))]
    NotFineTuned { step: &'static str },

    #[snafu(display("Cannot pretrain layer {layer}"))]
    Pretrain { source: RbmError, layer: usize },

    #[snafu(display("Cannot sample initial states"))]
    Sample { source: candle_core::Error },

    #[snafu(display("Cannot save performance metrics"))]
    SaveMetrics { source: MetricsError },

    #[snafu(display("Cannot update RBM parameters"))]
    SetParameters { source: RbmError },

    #[snafu(display("Wake-sleep fine-tuning failed"))]
    WakeSleep { source: candle_core::Error },
}

/// DBN configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbnConfig {
    init_stdev: f32,
    layers: Vec<usize>,
}

impl DbnConfig {
    /// Standard deviation of the initial RBM weights.
    ///
    /// Default: `0.01`
    pub fn init_stdev(mut self, init_stdev: f32) -> Self {
        self.init_stdev = init_stdev;
        self
    }

    /// Layer sizes, starting with the number of visible units.
    ///
    /// Layer `i` and `i + 1` are the visible and hidden units of RBM `i`.
    ///
    /// Default: `[784, 500, 500]`
    pub fn layers(mut self, layers: Vec<usize>) -> Self {
        self.layers = layers;
        self
    }

    /// Build a DBN of Bernoulli RBMs.
    pub fn build(&self, device: &Device, rng: &mut TensorRng) -> Result<Dbn, DbnError> {
        let rbms = self
            .layers
            .windows(2)
            .enumerate()
            .map(|(layer, sizes)| {
                RbmConfig::default()
                    .n_visible(sizes[0])
                    .n_hidden(sizes[1])
                    .init_stdev(self.init_stdev)
                    .build(device, rng)
                    .context(BuildRbmSnafu { layer })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Dbn::from_rbms(rbms)
    }
}

impl Default for DbnConfig {
    fn default() -> Self {
        Self {
            init_stdev: 0.01,
            layers: vec![784, 500, 500],
        }
    }
}

/// Representations computed by a bottom-up pass.
pub struct DbnOutput {
    layer_outputs: Vec<Tensor>,
}

impl DbnOutput {
    /// Hidden representations of all layers except the last.
    pub fn middle(&self) -> &[Tensor] {
        &self.layer_outputs[..self.layer_outputs.len().saturating_sub(1)]
    }

    /// Hidden representation of the last layer.
    pub fn last(&self) -> Option<&Tensor> {
        self.layer_outputs.last()
    }

    /// Hidden representations of all layers.
    pub fn all(&self) -> &[Tensor] {
        &self.layer_outputs
    }
}

/// Deep belief network.
pub struct Dbn {
    classifier: Option<LogisticRegression>,
    history: TrainingHistory,
    rbms: Vec<Rbm>,
    softmax: Option<SoftmaxOutput>,
    wake_sleep: Option<WakeSleepState>,
}

impl Dbn {
    /// Stack existing RBMs.
    ///
    /// The hidden width of each RBM must equal the visible width of the
    /// next one.
    pub fn from_rbms(rbms: Vec<Rbm>) -> Result<Self, DbnError> {
        ensure!(!rbms.is_empty(), EmptyLayersSnafu);
        for (layer, pair) in rbms.windows(2).enumerate() {
            let expected = pair[0].config().hidden_width();
            let got = pair[1].config().visible_width();
            ensure!(
                expected == got,
                LayerMismatchSnafu {
                    layer: layer + 1,
                    expected,
                    got
                }
            );
        }

        Ok(Self {
            classifier: None,
            history: TrainingHistory::default(),
            rbms,
            softmax: None,
            wake_sleep: None,
        })
    }

    /// Build a DBN from RBMs saved with [`Rbm::save`], bottom layer first.
    pub fn load_rbms<P: AsRef<Path>>(paths: &[P], device: &Device) -> Result<Self, DbnError> {
        let rbms = paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                Rbm::load(path, device).context(LoadRbmSnafu { path })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rbms(rbms)
    }

    /// The RBM layers, bottom first.
    pub fn rbms(&self) -> &[Rbm] {
        &self.rbms
    }

    /// Fine-tuning errors per epoch.
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Greedy layer-wise pretraining.
    ///
    /// Every RBM is trained on the hidden unit means of the RBM below it.
    /// The validation data is propagated through the stack in the same way.
    ///
    /// Returns the reconstruction error history of every layer.
    pub fn unsupervised_pretrain(
        &mut self,
        data: &Tensor,
        validation: Option<&Tensor>,
        config: &RbmTrainingConfig,
        rng: &mut TensorRng,
    ) -> Result<Vec<TrainingHistory>, DbnError> {
        let mut layer_input = data.clone();
        let mut layer_validation = validation.cloned();
        let mut histories = Vec::with_capacity(self.rbms.len());

        for (layer, rbm) in self.rbms.iter_mut().enumerate() {
            tracing::info!(
                layer,
                n_visible = rbm.n_visible(),
                n_hidden = rbm.n_hidden(),
                "Pretraining RBM"
            );
            histories.push(
                rbm.train(&layer_input, layer_validation.as_ref(), config, rng)
                    .context(PretrainSnafu { layer })?,
            );

            layer_input = rbm
                .transform(&layer_input)
                .context(ForwardSnafu { layer })?;
            layer_validation = layer_validation
                .map(|validation| rbm.transform(&validation))
                .transpose()
                .context(ForwardSnafu { layer })?;
        }

        Ok(histories)
    }

    /// Bottom-up pass, returning the hidden unit means of every layer.
    pub fn forward(&self, data: &Tensor) -> Result<DbnOutput, DbnError> {
        let mut layer_outputs = Vec::with_capacity(self.rbms.len());
        let mut layer_output = data.clone();
        for (layer, rbm) in self.rbms.iter().enumerate() {
            layer_output = rbm
                .hidden_probs(&layer_output)
                .context(ForwardSnafu { layer })?;
            layer_outputs.push(layer_output.clone());
        }
        Ok(DbnOutput { layer_outputs })
    }

    /// Top-down pass from the hidden units of the last RBM to the visible
    /// units of the first RBM.
    pub fn backward(&self, top: &Tensor) -> Result<Tensor, DbnError> {
        let mut layer_output = top.clone();
        for (layer, rbm) in self.rbms.iter().enumerate().rev() {
            layer_output = rbm
                .visible_probs(&layer_output)
                .context(ForwardSnafu { layer })?;
        }
        Ok(layer_output)
    }

    /// Fit a logistic regression layer on the last representation.
    pub fn fit_cls(
        &mut self,
        data: &Tensor,
        labels: &Tensor,
        n_classes: usize,
        config: LogisticRegressionConfig,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, DbnError> {
        let features = self.last_representation(data)?;
        let mut classifier = LogisticRegression::new(
            self.top_rbm().config().hidden_width(),
            n_classes,
            config,
            data.device(),
        )
        .context(ClassifierSnafu)?;
        let history = classifier
            .fit(&features, labels, rng)
            .context(ClassifierSnafu)?;
        self.classifier = Some(classifier);
        Ok(history)
    }

    /// Predict labels with the logistic regression layer.
    pub fn predict_cls(&self, data: &Tensor) -> Result<Tensor, DbnError> {
        let classifier = self
            .classifier
            .as_ref()
            .context(NotFineTunedSnafu { step: "Logistic" })?;
        classifier
            .predict(&self.last_representation(data)?)
            .context(ClassifierSnafu)
    }

    /// Generate samples from the model.
    ///
    /// Starts from random hidden states of the top RBM, runs `k` steps of
    /// Gibbs sampling in it and generates the visible units top-down.
    pub fn fantasy(
        &self,
        k: usize,
        n_samples: usize,
        rng: &mut TensorRng,
    ) -> Result<Tensor, DbnError> {
        let top = self.top_rbm();
        let states = Tensor::full(0.5f32, (n_samples, top.config().hidden_width()), top.device())
            .and_then(|probs| rng.bernoulli(&probs))
            .context(SampleSnafu)?;

        let visible = top.visible_probs(&states).context(FantasySnafu)?;
        let chain = top.gibbs_sampling(&visible, k, rng).context(FantasySnafu)?;
        self.backward(&chain.hidden_states)
    }

    /// Save the fine-tuning errors as JSON.
    pub fn save_performance_metrics(&self, path: impl AsRef<Path>) -> Result<(), DbnError> {
        self.history.save(path).context(SaveMetricsSnafu)
    }

    fn last_representation(&self, data: &Tensor) -> Result<Tensor, DbnError> {
        let output = self.forward(data)?;
        output.last().cloned().context(EmptyLayersSnafu)
    }

    fn check_labels(data: &Tensor, labels: &Tensor) -> Result<(), DbnError> {
        let n_samples = data.dim(0).context(WakeSleepSnafu)?;
        let n_labels = labels.dim(0).context(WakeSleepSnafu)?;
        ensure!(
            n_samples == n_labels,
            LabelCountSnafu {
                n_samples,
                n_labels
            }
        );
        Ok(())
    }

    fn top_rbm(&self) -> &Rbm {
        // Construction guarantees at least one layer.
        &self.rbms[self.rbms.len() - 1]
    }
}
