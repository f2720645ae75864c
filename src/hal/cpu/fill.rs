use crate::loom::{
    device::Queue,
    num::Scalar,
    tensor::{Tensor, TensorError},
};

/// Sets every element of `output` to `value`.
pub fn fill<T: Scalar>(queue: &Queue, output: &mut Tensor<T>, value: T) -> Result<(), TensorError> {
    let buffer = output.write_only(Some(queue))?;
    queue.enqueue("fill", move || {
        #[cfg(not(feature = "rayon"))]
        buffer.write_slice::<T>().fill(value);
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            buffer.write_slice::<T>().par_iter_mut().for_each(|x| *x = value);
        }
        Ok(())
    })?;
    Ok(())
}

/// Sets every element of `output` to its position in logical row-major order.
pub fn fill_with_index<T: Scalar>(
    queue: &Queue,
    output: &mut Tensor<T>,
) -> Result<(), TensorError> {
    let layout = output.layout();
    let buffer = output.write_only(Some(queue))?;
    queue.enqueue("fill_with_index", move || {
        #[cfg(not(feature = "rayon"))]
        let values = (0..layout.size()).map(T::from_index);
        #[cfg(feature = "rayon")]
        let values = {
            use rayon::prelude::*;
            let values: Vec<T> = (0..layout.size()).into_par_iter().map(T::from_index).collect();
            values.into_iter()
        };

        let mut data = buffer.write_slice::<T>();
        for (offset, value) in layout.offsets().zip(values) {
            data[offset] = value;
        }
        Ok(())
    })?;
    Ok(())
}
