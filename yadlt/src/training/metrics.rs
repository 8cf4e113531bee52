//! Training metrics.
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Metric errors.
#[derive(Debug, Snafu)]
pub enum MetricsError {
    #[snafu(display("Cannot compare predictions with labels"))]
    Compare { source: candle_core::Error },

    #[snafu(display("Cannot create metrics file: {}", path.to_string_lossy()))]
    Create { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot write metrics"))]
    Write { source: serde_json::Error },
}

/// Per-epoch training errors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    errors: Vec<f64>,
}

impl TrainingHistory {
    /// Record the error of an epoch.
    pub fn push(&mut self, error: f64) {
        self.errors.push(error);
    }

    /// Errors, one per epoch.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Error of the last epoch.
    pub fn last(&self) -> Option<f64> {
        self.errors.last().copied()
    }

    /// Append the epochs of another history.
    pub fn extend(&mut self, other: &TrainingHistory) {
        self.errors.extend_from_slice(&other.errors);
    }

    /// Save as JSON: `{"errors": [...]}`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MetricsError> {
        let path = path.as_ref();
        let file = File::create(path).context(CreateSnafu { path })?;
        serde_json::to_writer(BufWriter::new(file), self).context(WriteSnafu)
    }
}

/// Fraction of predictions that equal the labels.
///
/// Both tensors hold `u32` labels with shape `(n_samples,)`.
pub fn accuracy(predictions: &Tensor, labels: &Tensor) -> Result<f32, MetricsError> {
    predictions
        .to_dtype(DType::U32)
        .and_then(|p| p.eq(&labels.to_dtype(DType::U32)?))
        .and_then(|eq| eq.to_dtype(DType::F32))
        .and_then(|eq| eq.mean_all())
        .and_then(|mean| mean.to_scalar::<f32>())
        .context(CompareSnafu)
}

/// Mean of a list of per-batch values.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::{accuracy, TrainingHistory};

    #[test]
    fn computes_accuracy() {
        let predictions = Tensor::new(&[1u32, 2, 3, 4], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32, 0, 3, 0], &Device::Cpu).unwrap();
        assert_eq!(accuracy(&predictions, &labels).unwrap(), 0.5);
    }

    #[test]
    fn saves_errors_as_json() {
        let mut history = TrainingHistory::default();
        history.push(0.5);
        history.push(0.25);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        history.save(&path).unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert_eq!(json, r#"{"errors":[0.5,0.25]}"#);
    }
}
