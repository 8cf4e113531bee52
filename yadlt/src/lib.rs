//! Deep learning models on top of candle: restricted Boltzmann machines,
//! deep belief networks and (stacked) denoising autoencoders.
pub mod data;
pub mod error;
pub mod layers;
pub mod models;
pub mod training;
pub mod util;
