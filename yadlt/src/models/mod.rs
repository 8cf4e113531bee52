use candle_core::Tensor;

use crate::error::BoxedError;

pub mod autoencoder;

pub mod dbn;

pub mod logistic;

pub mod rbm;

pub mod rbm_classifier;

/// Trait for models that predict class labels.
pub trait Classifier {
    /// Predict class labels, `u32` with shape `(n_samples,)`.
    fn predict_labels(&self, xs: &Tensor) -> Result<Tensor, BoxedError>;

    /// Fraction of correctly predicted labels.
    fn accuracy(&self, xs: &Tensor, labels: &Tensor) -> Result<f32, BoxedError> {
        let predictions = self.predict_labels(xs)?;
        Ok(crate::training::accuracy(&predictions, labels)?)
    }
}

impl Classifier for logistic::LogisticRegression {
    fn predict_labels(&self, xs: &Tensor) -> Result<Tensor, BoxedError> {
        Ok(self.predict(xs)?)
    }
}

impl Classifier for rbm_classifier::RbmClassifier {
    fn predict_labels(&self, xs: &Tensor) -> Result<Tensor, BoxedError> {
        Ok(self.predict_logistic_cls(xs)?)
    }
}

impl Classifier for autoencoder::StackedDenoisingAutoencoder {
    fn predict_labels(&self, xs: &Tensor) -> Result<Tensor, BoxedError> {
        Ok(self.predict(xs)?)
    }
}
