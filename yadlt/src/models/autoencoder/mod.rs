//! Denoising autoencoders.
mod denoising;
pub use denoising::{
    DenoisingAutoencoder, DenoisingAutoencoderConfig, DenoisingAutoencoderError,
};

mod stacked;
pub use stacked::{
    DaeLayerParams, FineTuneConfig, StackedDenoisingAutoencoder,
    StackedDenoisingAutoencoderConfig, StackedDenoisingAutoencoderError,
};
