//! Gradient-based optimizers.
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer as CandleOptimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

/// Optimizer types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent.
    #[default]
    GradientDescent,

    /// Gradient descent with momentum.
    Momentum,

    /// AdaGrad (Duchi et al., 2011).
    ///
    /// See [Adaptive Subgradient Methods for Online Learning and Stochastic Optimization](https://jmlr.org/papers/v12/duchi11a.html).
    AdaGrad,

    /// Adam (Kingma and Ba, 2014).
    ///
    /// See [Adam: A Method for Stochastic Optimization](https://arxiv.org/abs/1412.6980).
    Adam,
}

impl OptimizerKind {
    /// Construct an optimizer for the given variables.
    ///
    /// * `vars` - Variables to optimize.
    /// * `learning_rate` - Learning rate.
    /// * `momentum` - Momentum, only used by [`OptimizerKind::Momentum`].
    pub fn build(
        self,
        vars: Vec<Var>,
        learning_rate: f64,
        momentum: f64,
    ) -> Result<Optimizer, candle_core::Error> {
        use OptimizerKind::*;
        Ok(match self {
            GradientDescent => Optimizer::GradientDescent(SGD::new(vars, learning_rate)?),
            Momentum => Optimizer::Momentum(MomentumSGD::new(
                vars,
                ParamsMomentum {
                    lr: learning_rate,
                    momentum,
                },
            )?),
            AdaGrad => Optimizer::AdaGrad(AdaGradOptimizer::new(
                vars,
                ParamsAdaGrad {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
            Adam => Optimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.,
                    ..Default::default()
                },
            )?),
        })
    }
}

/// A constructed optimizer.
pub enum Optimizer {
    GradientDescent(SGD),
    Momentum(MomentumSGD),
    AdaGrad(AdaGradOptimizer),
    Adam(AdamW),
}

impl Optimizer {
    /// Compute the gradients of `loss` and update the variables.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<(), candle_core::Error> {
        match self {
            Optimizer::GradientDescent(opt) => opt.backward_step(loss),
            Optimizer::Momentum(opt) => opt.backward_step(loss),
            Optimizer::AdaGrad(opt) => opt.backward_step(loss),
            Optimizer::Adam(opt) => opt.backward_step(loss),
        }
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::GradientDescent(opt) => opt.learning_rate(),
            Optimizer::Momentum(opt) => opt.learning_rate(),
            Optimizer::AdaGrad(opt) => opt.learning_rate(),
            Optimizer::Adam(opt) => opt.learning_rate(),
        }
    }

    /// Change the learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Optimizer::GradientDescent(opt) => opt.set_learning_rate(lr),
            Optimizer::Momentum(opt) => opt.set_learning_rate(lr),
            Optimizer::AdaGrad(opt) => opt.set_learning_rate(lr),
            Optimizer::Adam(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Momentum optimizer parameters.
#[derive(Clone, Copy, Debug)]
pub struct ParamsMomentum {
    pub lr: f64,
    pub momentum: f64,
}

/// Gradient descent with momentum.
///
/// `v = momentum * v + grad`, `w = w - lr * v`
pub struct MomentumSGD {
    vars: Vec<(Var, Tensor)>,
    params: ParamsMomentum,
}

impl CandleOptimizer for MomentumSGD {
    type Config = ParamsMomentum;

    fn new(vars: Vec<Var>, params: ParamsMomentum) -> Result<Self, candle_core::Error> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let velocity = var.zeros_like()?;
                Ok((var, velocity))
            })
            .collect::<Result<Vec<_>, candle_core::Error>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<(), candle_core::Error> {
        for (var, velocity) in self.vars.iter_mut() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *velocity = ((&*velocity * self.params.momentum)? + grad)?;
                var.set(&var.sub(&(&*velocity * self.params.lr)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// AdaGrad optimizer parameters.
#[derive(Clone, Copy, Debug)]
pub struct ParamsAdaGrad {
    pub lr: f64,
    pub eps: f64,
    pub initial_accumulator: f64,
}

impl Default for ParamsAdaGrad {
    fn default() -> Self {
        Self {
            lr: 0.01,
            eps: 1e-8,
            initial_accumulator: 0.1,
        }
    }
}

/// AdaGrad: per-parameter learning rates scaled by the accumulated squared
/// gradients.
pub struct AdaGradOptimizer {
    vars: Vec<(Var, Tensor)>,
    params: ParamsAdaGrad,
}

impl CandleOptimizer for AdaGradOptimizer {
    type Config = ParamsAdaGrad;

    fn new(vars: Vec<Var>, params: ParamsAdaGrad) -> Result<Self, candle_core::Error> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let accumulator = var.ones_like()?.affine(params.initial_accumulator, 0.)?;
                Ok((var, accumulator))
            })
            .collect::<Result<Vec<_>, candle_core::Error>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<(), candle_core::Error> {
        for (var, accumulator) in self.vars.iter_mut() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *accumulator = (&*accumulator + grad.sqr()?)?;
                let scale = (accumulator.sqrt()? + self.params.eps)?;
                let update = (grad.div(&scale)? * self.params.lr)?;
                var.set(&var.sub(&update)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Var};
    use rstest::rstest;

    use super::OptimizerKind;

    // Minimize (x - 3)^2.
    #[rstest]
    #[case(OptimizerKind::GradientDescent, 0.1)]
    #[case(OptimizerKind::Momentum, 0.05)]
    #[case(OptimizerKind::AdaGrad, 0.5)]
    #[case(OptimizerKind::Adam, 0.1)]
    fn optimizers_minimize_quadratic(#[case] kind: OptimizerKind, #[case] lr: f64) {
        let x = Var::new(&[0f32], &Device::Cpu).unwrap();
        let mut optimizer = kind.build(vec![x.clone()], lr, 0.5).unwrap();
        for _ in 0..500 {
            let loss = x
                .as_tensor()
                .affine(1., -3.)
                .and_then(|t| t.sqr())
                .and_then(|t| t.sum_all())
                .unwrap();
            optimizer.backward_step(&loss).unwrap();
        }
        let x = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((x - 3.).abs() < 0.1, "{kind:?} converged to {x}");
    }

    #[test]
    fn learning_rate_can_be_changed() {
        let x = Var::new(&[0f32], &Device::Cpu).unwrap();
        let mut optimizer = OptimizerKind::Momentum.build(vec![x], 0.1, 0.9).unwrap();
        optimizer.set_learning_rate(0.01);
        assert_eq!(optimizer.learning_rate(), 0.01);
    }
}
