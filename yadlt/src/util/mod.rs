pub mod device;

pub mod rng;

pub mod tensor_ext;

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;
    use std::fmt::Debug;

    use approx::{assert_relative_eq, AbsDiffEq, Relative, RelativeEq};
    use candle_core::{Tensor, WithDType};
    use ndarray::{ArrayBase, ArrayD, Data, Dimension};

    // Like TryInto, but we need our own trait so that we can implement it
    // for external types.
    pub trait IntoArrayD<T> {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>>;
    }

    impl<T> IntoArrayD<T> for Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            (&self).into_arrayd()
        }
    }

    impl<T> IntoArrayD<T> for &Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            let data = self.flatten_all()?.to_vec1()?;
            Ok(ArrayD::from_shape_vec(self.shape().dims(), data)?)
        }
    }

    impl<S, D, T> IntoArrayD<T> for ArrayBase<S, D>
    where
        D: Dimension,
        S: Data<Elem = T>,
        T: Clone,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            Ok(self.to_owned().into_dyn())
        }
    }

    /// Check that two tensors are equal with the given absolute (`epsilon`)
    /// and relative (`max_relative`) tolerances.
    macro_rules! assert_tensor_eq {
        ($lhs:expr, $rhs:expr $(, $opt:ident = $val:expr)*) => {
            crate::util::tests::assert_tensor_eq_($lhs, $rhs, approx::Relative::default()$(.$opt($val))*)
        };
        ($lhs:expr, $rhs:expr $(, $opt:ident = $val:expr)*,) => {
            crate::util::tests::assert_tensor_eq_($lhs, $rhs, approx::Relative::default()$(.$opt($val))*)
        };
    }
    pub(crate) use assert_tensor_eq;

    pub(crate) fn assert_tensor_eq_<T>(
        a: impl IntoArrayD<T>,
        b: impl IntoArrayD<T>,
        relative: Relative<T>,
    ) where
        T: AbsDiffEq<Epsilon = T> + RelativeEq + Clone + Debug,
    {
        let a = a.into_arrayd().expect("Cannot convert array");
        let b = b.into_arrayd().expect("Cannot convert array");

        assert_eq!(
            a.shape(),
            b.shape(),
            "Shape mismatch: {:?}, {:?}",
            a.shape(),
            b.shape()
        );

        assert_relative_eq!(
            a,
            b,
            epsilon = relative.epsilon,
            max_relative = relative.max_relative
        );
    }
}
