use std::str::FromStr;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Unknown activation name.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown activation function: {name}"))]
pub struct UnknownActivation {
    name: String,
}

/// Activation functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Logistic sigmoid.
    #[default]
    Sigmoid,

    /// Hyperbolic tangent.
    Tanh,

    /// Rectified linear unit (Fukushima, 1969).
    Relu,

    /// Identity.
    None,
}

impl FromStr for Activation {
    type Err = UnknownActivation;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "none" => Ok(Activation::None),
            _ => UnknownActivationSnafu { name }.fail(),
        }
    }
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(*self))
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        match self {
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
            Activation::Tanh => xs.tanh(),
            Activation::Relu => xs.relu(),
            Activation::None => Ok(xs.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Module, Tensor};
    use ndarray::arr1;
    use rstest::rstest;
    use snafu::{ResultExt, Whatever};

    use super::Activation;
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[rstest]
    #[case(Activation::Sigmoid, [0.268_941_4, 0.5, 0.880_797])]
    #[case(Activation::Tanh, [-0.761_594_2, 0., 0.964_027_6])]
    #[case(Activation::Relu, [0., 0., 2.])]
    #[case(Activation::None, [-1., 0., 2.])]
    fn activation_values(
        #[case] activation: Activation,
        #[case] expected: [f32; 3],
    ) -> Result<(), Whatever> {
        for device in test_devices() {
            let xs = Tensor::new(&[-1f32, 0., 2.], &device)
                .whatever_context("Cannot create tensor")?;
            assert_tensor_eq!(
                activation
                    .forward(&xs)
                    .whatever_context("Cannot apply activation")?,
                arr1(&expected).into_dyn(),
                epsilon = 1e-5
            );
        }
        Ok(())
    }

    #[test]
    fn parses_names() {
        assert_eq!("relu".parse::<Activation>().ok(), Some(Activation::Relu));
        assert_eq!("none".parse::<Activation>().ok(), Some(Activation::None));
        assert!("softplus".parse::<Activation>().is_err());
    }
}
