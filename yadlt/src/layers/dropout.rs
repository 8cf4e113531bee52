use candle_core::ModuleT;
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Dropout configuration.
///
/// Dropout is expressed as the probability of keeping a unit. Kept units
/// are scaled by `1 / keep_prob` during training.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutConfig {
    keep_prob: f32,
}

impl DropoutConfig {
    /// Probability of keeping a unit.
    ///
    /// Default: `1.0`
    pub fn keep_prob(mut self, keep_prob: f32) -> Self {
        self.keep_prob = keep_prob;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { keep_prob: 1.0 }
    }
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(Dropout::new(1.0 - self.keep_prob.clamp(0.0, 1.0))))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use super::DropoutConfig;
    use crate::layers::build_module::BuildModule;

    #[test]
    fn keeps_everything_at_inference() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().keep_prob(0.5).build(vb).unwrap();
        let xs = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        let ys = dropout.forward_t(&xs, false).unwrap();
        assert_eq!(ys.to_vec2::<f32>().unwrap(), xs.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn drops_or_scales_while_training() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().keep_prob(0.5).build(vb).unwrap();
        let xs = Tensor::ones((16, 16), DType::F32, &Device::Cpu).unwrap();
        let ys = dropout.forward_t(&xs, true).unwrap().to_vec2::<f32>().unwrap();
        assert!(ys.iter().flatten().all(|&y| y == 0. || y == 2.));
    }
}
