//! Up-down fine-tuning with a top-level associative memory.
//!
//! The network has the fixed architecture
//! `labels <-> top <-> pen -> hid -> vis`: the two pretrained RBMs provide
//! the recognition weights (`vis -> hid -> pen`), their transposes
//! initialize the untied generative weights (`pen -> hid -> vis`) and a new
//! RBM over `[pen, labels]` forms the associative memory.
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};

use super::{
    ArchitectureSnafu, BuildRbmSnafu, Dbn, DbnError, NotFineTunedSnafu, SetParametersSnafu,
    WakeSleepSnafu,
};
use crate::data::batches::{batch_indices, select};
use crate::data::preprocess::one_hot;
use crate::models::rbm::{Rbm, RbmConfig};
use crate::training::metrics::mean;
use crate::training::{Loss, Schedule, TrainingHistory};
use crate::util::rng::TensorRng;
use crate::util::tensor_ext::ArgmaxRows;

/// Wake-sleep configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeSleepConfig {
    batch_size: usize,
    epochs: usize,
    learning_rate: Schedule,
    top_gibbs_k: usize,
}

impl WakeSleepConfig {
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

    /// Gibbs sampling steps in the associative memory.
    ///
    /// Default: `1`
    pub fn top_gibbs_k(mut self, top_gibbs_k: usize) -> Self {
        self.top_gibbs_k = top_gibbs_k;
        self
    }
}

impl Default for WakeSleepConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            epochs: 10,
            learning_rate: Schedule::constant(0.01),
            top_gibbs_k: 1,
        }
    }
}

/// Parameters added by wake-sleep fine-tuning.
pub(crate) struct WakeSleepState {
    /// Generative weights `hid -> vis` and `pen -> hid`.
    generative: [Tensor; 2],
    n_labels: usize,
    n_pen: usize,
    /// Associative memory, visible units are `[pen, labels]`.
    top: Rbm,
}

impl WakeSleepState {
    fn pen_weights(&self) -> Result<Tensor, candle_core::Error> {
        self.top.weights().narrow(0, 0, self.n_pen)
    }

    fn label_weights(&self) -> Result<Tensor, candle_core::Error> {
        self.top.weights().narrow(0, self.n_pen, self.n_labels)
    }

    fn pen_bias(&self) -> Result<Tensor, candle_core::Error> {
        self.top.visible_bias().narrow(0, 0, self.n_pen)
    }

    fn label_bias(&self) -> Result<Tensor, candle_core::Error> {
        self.top.visible_bias().narrow(0, self.n_pen, self.n_labels)
    }

    /// Label logits given the top-level states.
    fn label_logits(&self, top: &Tensor) -> Result<Tensor, candle_core::Error> {
        affine(top, &self.label_weights()?.t()?, &self.label_bias()?)
    }

    /// Top-level means given the penultimate states and label probabilities.
    fn top_probs(&self, pen: &Tensor, labels: &Tensor) -> Result<Tensor, candle_core::Error> {
        let activation = (pen.matmul(&self.pen_weights()?)?
            + labels.matmul(&self.label_weights()?)?)?
        .broadcast_add(self.top.hidden_bias())?;
        candle_nn::ops::sigmoid(&activation)
    }
}

/// `xs · w + b`
fn affine(xs: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor, candle_core::Error> {
    xs.matmul(w)?.broadcast_add(b)
}

/// `σ(xs · w + b)`
fn logistic(xs: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor, candle_core::Error> {
    candle_nn::ops::sigmoid(&affine(xs, w, b)?)
}

/// `param + scale · lhsᵀ · rhs`
fn add_outer(
    param: &Tensor,
    lhs: &Tensor,
    rhs: &Tensor,
    scale: f64,
) -> Result<Tensor, candle_core::Error> {
    param + (lhs.t()?.matmul(rhs)? * scale)?
}

/// `param + scale · mean(delta)` over the batch.
fn add_mean(param: &Tensor, delta: &Tensor, scale: f64) -> Result<Tensor, candle_core::Error> {
    param + (delta.mean(0)? * scale)?
}

impl Dbn {
    /// Fine-tune the network with the up-down algorithm.
    ///
    /// * `n_top` - Number of hidden units of the associative memory.
    /// * `n_classes` - Number of label units.
    /// * `data` - Training data, *shape:* `(n_samples, n_visible)`.
    /// * `labels` - Class indices, *shape:* `(n_samples,)`, `u32`.
    ///
    /// Returns the cross-entropy of the label units per epoch.
    pub fn wake_sleep(
        &mut self,
        n_top: usize,
        n_classes: usize,
        data: &Tensor,
        labels: &Tensor,
        config: &WakeSleepConfig,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, DbnError> {
        let n_layers = self.rbms.len();
        ensure!(n_layers == 2, ArchitectureSnafu { n_layers });
        Self::check_labels(data, labels)?;

        let n_pen = self.rbms[1].config().hidden_width();
        let top = RbmConfig::default()
            .n_visible(n_pen + n_classes)
            .n_hidden(n_top)
            .build(data.device(), rng)
            .context(BuildRbmSnafu { layer: n_layers })?;
        let generative = [
            self.rbms[0]
                .weights()
                .t()
                .and_then(|w| w.contiguous())
                .context(WakeSleepSnafu)?,
            self.rbms[1]
                .weights()
                .t()
                .and_then(|w| w.contiguous())
                .context(WakeSleepSnafu)?,
        ];
        let mut state = WakeSleepState {
            generative,
            n_labels: n_classes,
            n_pen,
            top,
        };

        let targets = one_hot(labels, n_classes).context(WakeSleepSnafu)?;
        let n_samples = data.dim(0).context(WakeSleepSnafu)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..config.epochs {
            let learning_rate = config.learning_rate.value(epoch, config.epochs);
            let batches = batch_indices(
                n_samples,
                config.batch_size,
                Some(&mut *rng),
                data.device(),
            )
            .context(WakeSleepSnafu)?;

            let mut errors = Vec::with_capacity(batches.len());
            for indices in batches {
                let batch = select(data, &indices).context(WakeSleepSnafu)?;
                let batch_targets = select(&targets, &indices).context(WakeSleepSnafu)?;
                errors.push(self.wake_sleep_step(
                    &mut state,
                    &batch,
                    &batch_targets,
                    learning_rate,
                    config.top_gibbs_k.max(1),
                    rng,
                )?);
            }

            let error = mean(&errors);
            tracing::info!(
                epoch,
                learning_rate,
                cross_entropy = error,
                "Wake-sleep epoch finished"
            );
            history.push(error);
        }

        self.history.extend(&history);
        self.wake_sleep = Some(state);
        Ok(history)
    }

    fn wake_sleep_step(
        &mut self,
        state: &mut WakeSleepState,
        batch: &Tensor,
        targets: &Tensor,
        learning_rate: f64,
        top_gibbs_k: usize,
        rng: &mut TensorRng,
    ) -> Result<f64, DbnError> {
        let batch_size = batch.dim(0).context(WakeSleepSnafu)? as f64;
        let weight_rate = learning_rate / batch_size;

        let (w0, hb0, vb0) = parameters(&self.rbms[0]);
        let (w1, hb1, vb1) = parameters(&self.rbms[1]);
        let [g0, g1] = &state.generative;

        let mut step = || -> Result<_, candle_core::Error> {
            // Bottom-up pass.
            let wake_hid = rng.bernoulli(&logistic(batch, &w0, &hb0)?)?;
            let wake_pen = rng.bernoulli(&logistic(&wake_hid, &w1, &hb1)?)?;
            let joint = Tensor::cat(&[&wake_pen, targets], D::Minus1)?;
            let wake_top = rng.bernoulli(&logistic(
                &joint,
                state.top.weights(),
                state.top.hidden_bias(),
            )?)?;

            let pos_lab_top = targets.t()?.matmul(&wake_top)?;
            let pos_pen_top = wake_pen.t()?.matmul(&wake_top)?;

            // Alternating Gibbs sampling in the associative memory.
            let pen_weights_t = state.pen_weights()?.t()?;
            let pen_bias = state.pen_bias()?;
            let mut neg_top = wake_top.clone();
            let mut neg_pen = wake_pen.clone();
            let mut lab_logits = state.label_logits(&neg_top)?;
            let mut neg_lab = candle_nn::ops::softmax_last_dim(&lab_logits)?;
            for _ in 0..top_gibbs_k {
                neg_pen = rng.bernoulli(&logistic(&neg_top, &pen_weights_t, &pen_bias)?)?;
                lab_logits = state.label_logits(&neg_top)?;
                neg_lab = candle_nn::ops::softmax_last_dim(&lab_logits)?;
                neg_top = rng.bernoulli(&state.top_probs(&neg_pen, &neg_lab)?)?;
            }
            let error = Loss::SoftmaxCrossEntropy
                .compute(&lab_logits, targets)?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;

            // Top-down generative pass from the end of the Gibbs chain.
            let sleep_pen = &neg_pen;
            let sleep_hid = rng.bernoulli(&logistic(sleep_pen, g1, &vb1)?)?;
            let sleep_vis = logistic(&sleep_hid, g0, &vb0)?;

            // Predictions.
            let p_sleep_pen = logistic(&sleep_hid, &w1, &hb1)?;
            let p_sleep_hid = logistic(&sleep_vis, &w0, &hb0)?;
            let p_vis = logistic(&wake_hid, g0, &vb0)?;
            let p_hid = logistic(&wake_pen, g1, &vb1)?;

            // Generative parameters.
            let vis_delta = (batch - &p_vis)?;
            let hid_delta = (&wake_hid - &p_hid)?;
            let g0 = add_outer(g0, &wake_hid, &vis_delta, weight_rate)?;
            let vb0 = add_mean(&vb0, &vis_delta, learning_rate)?;
            let g1 = add_outer(g1, &wake_pen, &hid_delta, weight_rate)?;
            let vb1 = add_mean(&vb1, &hid_delta, learning_rate)?;

            // Associative memory.
            let neg_lab_top = neg_lab.t()?.matmul(&neg_top)?;
            let neg_pen_top = neg_pen.t()?.matmul(&neg_top)?;
            let pen_weights =
                (state.pen_weights()? + ((pos_pen_top - neg_pen_top)? * weight_rate)?)?;
            let label_weights =
                (state.label_weights()? + ((pos_lab_top - neg_lab_top)? * weight_rate)?)?;
            let pen_bias = add_mean(&pen_bias, &(&wake_pen - &neg_pen)?, learning_rate)?;
            let label_bias = add_mean(
                &state.label_bias()?,
                &(targets - &neg_lab)?,
                learning_rate,
            )?;
            let top_bias = add_mean(
                state.top.hidden_bias(),
                &(&wake_top - &neg_top)?,
                learning_rate,
            )?;
            let top = (
                Tensor::cat(&[&pen_weights, &label_weights], 0)?,
                Tensor::cat(&[&pen_bias, &label_bias], 0)?,
                top_bias,
            );

            // Recognition parameters.
            let pen_delta = (sleep_pen - &p_sleep_pen)?;
            let sleep_hid_delta = (&sleep_hid - &p_sleep_hid)?;
            let w1 = add_outer(&w1, &sleep_hid, &pen_delta, weight_rate)?;
            let hb1 = add_mean(&hb1, &pen_delta, learning_rate)?;
            let w0 = add_outer(&w0, &sleep_vis, &sleep_hid_delta, weight_rate)?;
            let hb0 = add_mean(&hb0, &sleep_hid_delta, learning_rate)?;

            Ok((error, [g0, g1], top, [(w0, vb0, hb0), (w1, vb1, hb1)]))
        };

        let (error, generative, top, recognition) = step().context(WakeSleepSnafu)?;

        state.generative = generative;
        let (top_weights, top_visible_bias, top_hidden_bias) = top;
        state
            .top
            .set_parameters(top_weights, top_visible_bias, top_hidden_bias)
            .context(SetParametersSnafu)?;
        for (rbm, (weights, visible_bias, hidden_bias)) in self.rbms.iter_mut().zip(recognition) {
            rbm.set_parameters(weights, visible_bias, hidden_bias)
                .context(SetParametersSnafu)?;
        }

        Ok(error)
    }

    /// Predict labels after wake-sleep fine-tuning.
    ///
    /// A deterministic bottom-up pass gives the penultimate representation.
    /// The associative memory is then clamped on it and the label units,
    /// which start from a uniform distribution, are updated with
    /// `top_gibbs_k` steps of mean-field alternating Gibbs sampling.
    pub fn predict_ws(&self, data: &Tensor, top_gibbs_k: usize) -> Result<Tensor, DbnError> {
        let state = self
            .wake_sleep
            .as_ref()
            .context(NotFineTunedSnafu { step: "Wake-sleep" })?;
        let (w0, hb0, _) = parameters(&self.rbms[0]);
        let (w1, hb1, _) = parameters(&self.rbms[1]);

        let predict = || -> Result<Tensor, candle_core::Error> {
            let hid = logistic(data, &w0, &hb0)?;
            let pen = logistic(&hid, &w1, &hb1)?;

            let n_samples = data.dim(0)?;
            let mut lab = Tensor::full(
                1. / state.n_labels as f32,
                (n_samples, state.n_labels),
                data.device(),
            )?;
            let mut top = state.top_probs(&pen, &lab)?;
            for _ in 0..top_gibbs_k.max(1) {
                lab = candle_nn::ops::softmax_last_dim(&state.label_logits(&top)?)?;
                top = state.top_probs(&pen, &lab)?;
            }
            lab.argmax_rows()
        };

        predict().context(WakeSleepSnafu)
    }
}

fn parameters(rbm: &Rbm) -> (Tensor, Tensor, Tensor) {
    (
        rbm.weights().clone(),
        rbm.hidden_bias().clone(),
        rbm.visible_bias().clone(),
    )
}

#[cfg(test)]
mod tests {
    use candle_core::Tensor;
    use rstest::rstest;

    use super::WakeSleepConfig;
    use crate::models::dbn::tests::{labelled_patterns, pretrained, rng};
    use crate::models::dbn::DbnError;
    use crate::training::accuracy;
    use crate::util::rng::TensorRng;

    #[rstest]
    fn requires_two_layers(mut rng: TensorRng) {
        let (data, labels) = labelled_patterns(20, &mut rng);
        let mut dbn = pretrained(vec![8, 6, 5, 4], &data, &mut rng);
        assert!(matches!(
            dbn.wake_sleep(10, 2, &data, &labels, &WakeSleepConfig::default(), &mut rng),
            Err(DbnError::Architecture { n_layers: 3 })
        ));
    }

    #[rstest]
    fn rejects_label_count_mismatch(mut rng: TensorRng) {
        let (data, labels) = labelled_patterns(20, &mut rng);
        let mut dbn = pretrained(vec![8, 6, 4], &data, &mut rng);
        let labels = labels.narrow(0, 0, 10).unwrap();
        assert!(matches!(
            dbn.wake_sleep(10, 2, &data, &labels, &WakeSleepConfig::default(), &mut rng),
            Err(DbnError::LabelCount {
                n_samples: 20,
                n_labels: 10
            })
        ));
    }

    #[rstest]
    fn fine_tunes_and_predicts(mut rng: TensorRng) {
        let (data, labels) = labelled_patterns(60, &mut rng);
        let mut dbn = pretrained(vec![8, 6, 4], &data, &mut rng);

        assert!(matches!(
            dbn.predict_ws(&data, 1),
            Err(DbnError::NotFineTuned { .. })
        ));

        let history = dbn
            .wake_sleep(
                10,
                2,
                &data,
                &labels,
                &WakeSleepConfig::default().epochs(5).learning_rate(0.05),
                &mut rng,
            )
            .unwrap();
        assert_eq!(history.errors().len(), 5);
        assert!(history.errors().iter().all(|e| e.is_finite() && *e >= 0.));
        assert_eq!(dbn.history().errors(), history.errors());

        // Shapes are preserved by the updates.
        assert_eq!(dbn.rbms()[0].weights().dims(), &[8, 6]);
        assert_eq!(dbn.rbms()[1].weights().dims(), &[6, 4]);

        let predictions = dbn
            .predict_ws(&data, 3)
            .unwrap()
            .to_vec1::<u32>()
            .unwrap();
        assert_eq!(predictions.len(), 60);
        assert!(predictions.iter().all(|&p| p < 2));
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .and_then(|d| d.abs())
            .and_then(|d| d.max_all())
            .and_then(|d| d.to_scalar::<f32>())
            .unwrap()
    }

    #[rstest]
    fn learns_separable_labels(mut rng: TensorRng) {
        let (data, labels) = labelled_patterns(80, &mut rng);
        let mut dbn = pretrained(vec![8, 6, 4], &data, &mut rng);
        let recognition_before = dbn
            .rbms()
            .iter()
            .map(|rbm| rbm.weights().clone())
            .collect::<Vec<_>>();

        let history = dbn
            .wake_sleep(
                16,
                2,
                &data,
                &labels,
                &WakeSleepConfig::default().epochs(100).learning_rate(0.1),
                &mut rng,
            )
            .unwrap();
        let first = history.errors()[0];
        let last = history.last().unwrap();
        assert!(last < first, "label error went from {first} to {last}");

        let predictions = dbn.predict_ws(&data, 5).unwrap();
        let accuracy = accuracy(&predictions, &labels).unwrap();
        assert!(accuracy > 0.8, "accuracy: {accuracy}");

        // Recognition and generative weights are both updated.
        let state = dbn.wake_sleep.as_ref().unwrap();
        for (layer, (rbm, before)) in dbn.rbms().iter().zip(&recognition_before).enumerate() {
            assert!(
                max_abs_diff(rbm.weights(), before) > 1e-4,
                "recognition weights of layer {layer} did not change"
            );
            let generative_before = before.t().unwrap();
            assert!(
                max_abs_diff(&state.generative[layer], &generative_before) > 1e-4,
                "generative weights of layer {layer} did not change"
            );
            // Untied after fine-tuning.
            let recognition_t = rbm.weights().t().unwrap();
            assert!(max_abs_diff(&state.generative[layer], &recognition_t) > 1e-4);
        }
    }
}
