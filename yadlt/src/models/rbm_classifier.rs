//! Logistic regression on features learned by an RBM.
use candle_core::Tensor;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::models::logistic::{
    LogisticRegression, LogisticRegressionConfig, LogisticRegressionError,
};
use crate::models::rbm::{Rbm, RbmError, RbmTrainingConfig};
use crate::training::TrainingHistory;
use crate::util::rng::TensorRng;

/// RBM classifier errors.
#[derive(Debug, Snafu)]
pub enum RbmClassifierError {
    #[snafu(display("Cannot construct logistic regression classifier"))]
    Classifier { source: LogisticRegressionError },

    #[snafu(display("Cannot extract features"))]
    Features { source: RbmError },

    #[snafu(display("Cannot learn features"))]
    LearnFeatures { source: RbmError },

    #[snafu(display("Logistic regression layer was not fitted"))]
    NotFitted,
}

/// RBM feature extractor with a logistic regression layer on top.
pub struct RbmClassifier {
    classifier: Option<LogisticRegression>,
    logistic_config: LogisticRegressionConfig,
    n_classes: usize,
    rbm: Rbm,
}

impl RbmClassifier {
    /// Wrap an RBM, the classifier predicts `n_classes` classes.
    pub fn new(rbm: Rbm, n_classes: usize, logistic_config: LogisticRegressionConfig) -> Self {
        Self {
            classifier: None,
            logistic_config,
            n_classes,
            rbm,
        }
    }

    /// The feature extractor.
    pub fn rbm(&self) -> &Rbm {
        &self.rbm
    }

    /// Train the RBM on unlabelled data.
    pub fn learn_unsupervised_features(
        &mut self,
        data: &Tensor,
        validation: Option<&Tensor>,
        config: &RbmTrainingConfig,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, RbmClassifierError> {
        self.rbm
            .train(data, validation, config, rng)
            .context(LearnFeaturesSnafu)
    }

    /// Fit the logistic regression layer on the hidden unit means.
    pub fn fit_logistic_cls(
        &mut self,
        data: &Tensor,
        labels: &Tensor,
        rng: &mut TensorRng,
    ) -> Result<TrainingHistory, RbmClassifierError> {
        let features = self.rbm.transform(data).context(FeaturesSnafu)?;
        let mut classifier = LogisticRegression::new(
            self.rbm.config().hidden_width(),
            self.n_classes,
            self.logistic_config.clone(),
            self.rbm.device(),
        )
        .context(ClassifierSnafu)?;
        let history = classifier
            .fit(&features, labels, rng)
            .context(ClassifierSnafu)?;
        self.classifier = Some(classifier);
        Ok(history)
    }

    /// Predict class labels.
    pub fn predict_logistic_cls(&self, data: &Tensor) -> Result<Tensor, RbmClassifierError> {
        let classifier = self.classifier.as_ref().context(NotFittedSnafu)?;
        let features = self.rbm.transform(data).context(FeaturesSnafu)?;
        classifier.predict(&features).context(ClassifierSnafu)
    }

    /// Accuracy of the predicted labels.
    pub fn score(&self, data: &Tensor, labels: &Tensor) -> Result<f32, RbmClassifierError> {
        let classifier = self.classifier.as_ref().context(NotFittedSnafu)?;
        let features = self.rbm.transform(data).context(FeaturesSnafu)?;
        classifier.score(&features, labels).context(ClassifierSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::{RbmClassifier, RbmClassifierError};
    use crate::models::logistic::LogisticRegressionConfig;
    use crate::models::rbm::tests::binary_patterns;
    use crate::models::rbm::{RbmConfig, RbmTrainingConfig};
    use crate::util::rng::TensorRng;

    #[test]
    fn classifies_learned_features() {
        let mut rng = TensorRng::seed_from_u64(3);
        let data = binary_patterns(60, &mut rng);
        // Patterns alternate between the two prototypes.
        let labels = Tensor::new(
            (0..60u32).map(|i| i % 2).collect::<Vec<_>>(),
            &Device::Cpu,
        )
        .unwrap();

        let rbm = RbmConfig::default()
            .n_visible(8)
            .n_hidden(4)
            .build(&Device::Cpu, &mut rng)
            .unwrap();
        let mut classifier = RbmClassifier::new(
            rbm,
            2,
            LogisticRegressionConfig::default().batch_size(10).epochs(30),
        );

        assert!(matches!(
            classifier.predict_logistic_cls(&data),
            Err(RbmClassifierError::NotFitted)
        ));

        classifier
            .learn_unsupervised_features(
                &data,
                None,
                &RbmTrainingConfig::default()
                    .epochs(20)
                    .learning_rate(0.1),
                &mut rng,
            )
            .unwrap();
        classifier.fit_logistic_cls(&data, &labels, &mut rng).unwrap();

        let predictions = classifier.predict_logistic_cls(&data).unwrap();
        assert_eq!(predictions.dims(), &[60]);
        assert!(classifier.score(&data, &labels).unwrap() > 0.9);
    }
}
