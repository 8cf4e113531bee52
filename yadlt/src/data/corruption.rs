//! Input corruption for denoising autoencoders.
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::util::rng::TensorRng;

/// Input corruption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "fraction", rename_all = "snake_case")]
pub enum Corruption {
    /// Leave the input untouched.
    #[default]
    None,

    /// Set a fraction of the inputs to zero.
    Masking(f32),

    /// Set a fraction of the inputs to the minimum or the maximum value of
    /// the batch, each with probability one half.
    SaltAndPepper(f32),
}

impl Corruption {
    /// Build a corruption from its name and fraction.
    pub fn from_name(name: &str, fraction: f32) -> Option<Self> {
        match name {
            "none" => Some(Corruption::None),
            "masking" => Some(Corruption::Masking(fraction)),
            "salt_and_pepper" => Some(Corruption::SaltAndPepper(fraction)),
            _ => None,
        }
    }

    /// Corrupt a batch of inputs.
    pub fn apply(&self, xs: &Tensor, rng: &mut TensorRng) -> Result<Tensor, candle_core::Error> {
        match *self {
            Corruption::None => Ok(xs.clone()),
            Corruption::Masking(fraction) => {
                let keep = rng
                    .uniform(xs.shape(), xs.device())?
                    .ge(fraction as f64)?
                    .to_dtype(xs.dtype())?;
                xs * keep
            }
            Corruption::SaltAndPepper(fraction) => {
                let min = xs.min_all()?.to_scalar::<f32>()?;
                let max = xs.max_all()?.to_scalar::<f32>()?;

                let corrupt = rng
                    .uniform(xs.shape(), xs.device())?
                    .lt(fraction as f64)?
                    .to_dtype(xs.dtype())?;
                let salt = rng
                    .uniform(xs.shape(), xs.device())?
                    .lt(0.5)?
                    .to_dtype(xs.dtype())?;
                // salt -> max, pepper -> min
                let noise = salt.affine((max - min) as f64, min as f64)?;

                let keep = corrupt.affine(-1., 1.)?;
                (xs * keep)? + (noise * corrupt)?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::Corruption;
    use crate::util::rng::TensorRng;

    fn count(xs: &Tensor, value: f32) -> usize {
        xs.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .filter(|&x| x == value)
            .count()
    }

    #[test]
    fn masking_zeroes_about_the_fraction() {
        let xs = Tensor::ones((50, 40), DType::F32, &Device::Cpu).unwrap();
        let corrupted = Corruption::Masking(0.3)
            .apply(&xs, &mut TensorRng::seed_from_u64(0))
            .unwrap();
        let zeros = count(&corrupted, 0.0) as f32 / 2000.0;
        assert!((zeros - 0.3).abs() < 0.05, "zero fraction {zeros}");
    }

    #[test]
    fn salt_and_pepper_uses_extremes() {
        let xs = (Tensor::ones((50, 40), DType::F32, &Device::Cpu).unwrap() * 0.5).unwrap();
        let xs = Tensor::cat(
            &[
                &xs,
                &Tensor::new(&[[0f32; 40]], &Device::Cpu).unwrap(),
                &Tensor::new(&[[1f32; 40]], &Device::Cpu).unwrap(),
            ],
            0,
        )
        .unwrap();
        let corrupted = Corruption::SaltAndPepper(0.2)
            .apply(&xs, &mut TensorRng::seed_from_u64(4))
            .unwrap();
        let values = corrupted.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&x| x == 0.0 || x == 0.5 || x == 1.0));
        let changed = values[..2000].iter().filter(|&&x| x != 0.5).count() as f32 / 2000.0;
        assert!((changed - 0.2).abs() < 0.05, "changed fraction {changed}");
    }

    #[test]
    fn none_is_identity() {
        let xs = Tensor::new(&[[0.2f32, 0.4]], &Device::Cpu).unwrap();
        let ys = Corruption::None
            .apply(&xs, &mut TensorRng::default())
            .unwrap();
        assert_eq!(ys.to_vec2::<f32>().unwrap(), vec![vec![0.2, 0.4]]);
    }

    #[test]
    fn parses_names() {
        assert_eq!(
            Corruption::from_name("masking", 0.1),
            Some(Corruption::Masking(0.1))
        );
        assert_eq!(Corruption::from_name("gaussian", 0.1), None);
    }
}
