use std::ops::{Add, Mul};

use crate::loom::{
    device::Queue,
    num::{One, Scalar, Zero},
    tensor::{Tensor, TensorError},
};

/// Folds all elements of `input` into the single element of `output`.
///
/// `f` must be associative and `initial` its identity, since the fold may be split
/// across threads.
pub fn reduce<T, F>(
    queue: &Queue,
    input: &Tensor<T>,
    output: &mut Tensor<T>,
    initial: T,
    f: F,
) -> Result<(), TensorError>
where
    T: Scalar,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    if output.count() != 1 {
        return Err(TensorError::Reduce(output.count()));
    }
    let x = input.read_only(Some(queue))?;
    let y = output.write_only(Some(queue))?;
    queue.enqueue("reduce", move || {
        let x = x.read_slice::<T>();

        #[cfg(not(feature = "rayon"))]
        let value = x.iter().fold(initial, |acc, &x| f(acc, x));
        #[cfg(feature = "rayon")]
        let value = {
            use rayon::prelude::*;
            x.par_iter().copied().reduce(|| initial, &f)
        };

        y.write_slice::<T>()[0] = value;
        Ok(())
    })?;
    Ok(())
}

/// Sums all elements of `input` into the single element of `output`.
#[inline]
pub fn sum<T>(queue: &Queue, input: &Tensor<T>, output: &mut Tensor<T>) -> Result<(), TensorError>
where
    T: Scalar + Add<Output = T>,
{
    reduce(queue, input, output, <T as Zero>::zero(), T::add)
}

/// Multiplies all elements of `input` into the single element of `output`.
#[inline]
pub fn product<T>(
    queue: &Queue,
    input: &Tensor<T>,
    output: &mut Tensor<T>,
) -> Result<(), TensorError>
where
    T: Scalar + Mul<Output = T>,
{
    reduce(queue, input, output, <T as One>::one(), T::mul)
}
