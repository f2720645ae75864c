use std::ops::Neg;

use crate::loom::{
    device::Queue,
    num::Scalar,
    tensor::{Tensor, TensorError},
};

/// Applies `f` to every element of `input`, writing the results into `output`.
pub fn map<T, U, F>(
    queue: &Queue,
    input: &Tensor<T>,
    output: &mut Tensor<U>,
    f: F,
) -> Result<(), TensorError>
where
    T: Scalar,
    U: Scalar,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    output.check_layout(&input.layout())?;
    let x = input.read_only(Some(queue))?;
    let y = output.write_only(Some(queue))?;
    queue.enqueue("map", move || {
        let x = x.read_slice::<T>();
        let mut y = y.write_slice::<U>();

        #[cfg(not(feature = "rayon"))]
        {
            use itertools::Itertools;
            y.iter_mut()
                .zip_eq(x.iter())
                .for_each(|(y, &x)| *y = f(x));
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            y.par_iter_mut()
                .zip_eq(x.par_iter())
                .for_each(|(y, &x)| *y = f(x));
        }
        Ok(())
    })?;
    Ok(())
}

/// Negates every element of `input`.
#[inline]
pub fn neg<T>(queue: &Queue, input: &Tensor<T>, output: &mut Tensor<T>) -> Result<(), TensorError>
where
    T: Scalar + Neg<Output = T>,
{
    map(queue, input, output, T::neg)
}

/// Combines the elements of `x` and `y` pairwise with `f`, writing the results into `output`.
pub fn zip_map<T, U, V, F>(
    queue: &Queue,
    x: &Tensor<T>,
    y: &Tensor<U>,
    output: &mut Tensor<V>,
    f: F,
) -> Result<(), TensorError>
where
    T: Scalar,
    U: Scalar,
    V: Scalar,
    F: Fn(T, U) -> V + Send + Sync + 'static,
{
    x.check_layout(&y.layout())?;
    output.check_layout(&x.layout())?;
    let x = x.read_only(Some(queue))?;
    let y = y.read_only(Some(queue))?;
    let z = output.write_only(Some(queue))?;
    queue.enqueue("zip_map", move || {
        let x = x.read_slice::<T>();
        let y = y.read_slice::<U>();
        let mut z = z.write_slice::<V>();

        #[cfg(not(feature = "rayon"))]
        {
            use itertools::izip;
            izip!(z.iter_mut(), x.iter(), y.iter()).for_each(|(z, &x, &y)| *z = f(x, y));
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            z.par_iter_mut()
                .zip_eq(x.par_iter().zip_eq(y.par_iter()))
                .for_each(|(z, (&x, &y))| *z = f(x, y));
        }
        Ok(())
    })?;
    Ok(())
}
