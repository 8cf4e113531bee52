use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Layer configurations of the stacked autoencoder network.
///
/// Activations and dropout are built into the fine-tuning network between
/// the encoding layers. Layers that own weights look them up through the
/// variable builder, so the same configuration builds a network that
/// starts from pretrained autoencoder weights or from a saved checkpoint.
pub trait BuildModule: Debug {
    /// Build the layer. `train` in [`ModuleT::forward_t`] enables dropout.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
