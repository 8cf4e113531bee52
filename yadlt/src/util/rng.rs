//! Seeded random tensors.
use candle_core::{Device, Shape, Tensor, D};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_core::SeedableRng;
use rand_pcg::Pcg32;

/// Pseudo-random number generator that produces tensors.
///
/// All sampling in the models goes through this type, so that a run is
/// fully determined by its seed.
#[derive(Clone, Debug)]
pub struct TensorRng {
    rng: Pcg32,
}

impl TensorRng {
    /// Create a generator from a seed.
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    /// Uniform samples from `[0, 1)`.
    pub fn uniform(
        &mut self,
        shape: impl Into<Shape>,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| self.rng.gen::<f32>())
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, device)
    }

    /// Normal samples with the given mean and standard deviation.
    pub fn normal(
        &mut self,
        shape: impl Into<Shape>,
        mean: f32,
        stdev: f32,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| mean + stdev * self.standard_normal())
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, device)
    }

    /// Sample binary states, each unit is on with the given probability.
    pub fn bernoulli(&mut self, probs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let uniform = self.uniform(probs.shape(), probs.device())?;
        uniform.lt(probs)?.to_dtype(probs.dtype())
    }

    /// Sample one-hot states from consecutive groups of `group_size`
    /// probabilities.
    ///
    /// `probs` has shape `(batch_size, n_units * group_size)` and the
    /// probabilities of every group must sum to one.
    pub fn categorical(
        &mut self,
        probs: &Tensor,
        group_size: usize,
    ) -> Result<Tensor, candle_core::Error> {
        let (batch_size, width) = probs.dims2()?;
        let n_units = width / group_size;
        let grouped = probs.reshape((batch_size, n_units, group_size))?;

        let threshold = self.uniform((batch_size, n_units, 1), probs.device())?;

        // The last state always closes the cumulative distribution, rounding
        // errors must not leave a group without a state.
        let cumulative = grouped.cumsum(D::Minus1)?;
        let reached = cumulative
            .narrow(D::Minus1, 0, group_size - 1)?
            .broadcast_ge(&threshold)?
            .to_dtype(probs.dtype())?;
        let ones = Tensor::ones((batch_size, n_units, 1), probs.dtype(), probs.device())?;
        let reached = Tensor::cat(&[&reached, &ones], D::Minus1)?;

        let zeros = Tensor::zeros((batch_size, n_units, 1), probs.dtype(), probs.device())?;
        let reached_before = Tensor::cat(
            &[&zeros, &reached.narrow(D::Minus1, 0, group_size - 1)?],
            D::Minus1,
        )?;

        (reached - reached_before)?.reshape((batch_size, width))
    }

    /// Random permutation of `0..n`.
    pub fn permutation(&mut self, n: usize) -> Vec<u32> {
        let mut indices = (0..n as u32).collect::<Vec<_>>();
        indices.shuffle(&mut self.rng);
        indices
    }

    /// Derive an independent generator, e.g. for a sub-model.
    pub fn fork(&mut self) -> Self {
        Self::seed_from_u64(self.rng.gen())
    }

    // Box-Muller transform.
    fn standard_normal(&mut self) -> f32 {
        let u1 = 1.0 - self.rng.gen::<f32>();
        let u2 = self.rng.gen::<f32>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}

impl Default for TensorRng {
    fn default() -> Self {
        Self::seed_from_u64(42)
    }
}

/// Convert a list of indices to an index tensor.
pub(crate) fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor, candle_core::Error> {
    Tensor::from_slice(indices, indices.len(), device)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::TensorRng;

    #[test]
    #[report]
    fn same_seed_gives_same_samples() -> Result<(), Whatever> {
        let mut a = TensorRng::seed_from_u64(7);
        let mut b = TensorRng::seed_from_u64(7);
        let xs = a
            .uniform((4, 5), &Device::Cpu)
            .and_then(|t| t.to_vec2::<f32>())
            .whatever_context("Cannot sample")?;
        let ys = b
            .uniform((4, 5), &Device::Cpu)
            .and_then(|t| t.to_vec2::<f32>())
            .whatever_context("Cannot sample")?;
        assert_eq!(xs, ys);
        assert!(xs.iter().flatten().all(|&x| (0.0..1.0).contains(&x)));
        Ok(())
    }

    #[test]
    #[report]
    fn bernoulli_respects_extreme_probabilities() -> Result<(), Whatever> {
        let mut rng = TensorRng::seed_from_u64(1);
        let probs = Tensor::new(&[[0f32, 1., 0., 1.], [1., 1., 0., 0.]], &Device::Cpu)
            .whatever_context("Cannot create probs")?;
        let states = rng
            .bernoulli(&probs)
            .and_then(|t| t.to_vec2::<f32>())
            .whatever_context("Cannot sample")?;
        assert_eq!(states, vec![vec![0., 1., 0., 1.], vec![1., 1., 0., 0.]]);
        Ok(())
    }

    #[test]
    #[report]
    fn categorical_samples_one_state_per_group() -> Result<(), Whatever> {
        let mut rng = TensorRng::seed_from_u64(3);
        let probs = Tensor::new(
            &[[0.2f32, 0.3, 0.5, 0., 0., 1.], [1., 0., 0., 0.3, 0.3, 0.4]],
            &Device::Cpu,
        )
        .whatever_context("Cannot create probs")?;
        let states = rng
            .categorical(&probs, 3)
            .and_then(|t| t.to_vec2::<f32>())
            .whatever_context("Cannot sample")?;

        for row in &states {
            for group in row.chunks(3) {
                assert_eq!(group.iter().sum::<f32>(), 1.0);
                assert!(group.iter().all(|&x| x == 0.0 || x == 1.0));
            }
        }
        assert_eq!(&states[0][3..], &[0., 0., 1.]);
        assert_eq!(&states[1][..3], &[1., 0., 0.]);
        Ok(())
    }

    #[test]
    fn permutation_contains_every_index() {
        let mut rng = TensorRng::seed_from_u64(11);
        let mut perm = rng.permutation(100);
        perm.sort_unstable();
        assert_eq!(perm, (0..100).collect::<Vec<_>>());
    }
}
