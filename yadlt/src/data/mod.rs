//! Datasets and data preparation.
pub mod batches;

pub mod corruption;
pub use corruption::Corruption;

pub mod mnist;
pub use mnist::{IdxError, Mnist};

pub mod preprocess;
