mod activation;
pub use activation::{Activation, UnknownActivation};

pub mod build_module;

pub mod dropout;
