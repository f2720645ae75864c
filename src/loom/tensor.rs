use std::{
    marker::PhantomData,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;

use super::{
    array::{TensorArray, TensorId},
    category,
    device::{DeviceBuffer, Queue, QueueError},
    layout::{IntoLayout, Layout, Shape},
    num::{DataType, Scalar},
    ops::Access,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: layout {0}'s size not match data len {1}")]
    Create(Layout, usize),
    #[error("tensor reshape error: layout {0}'s size not match layout {1}'s")]
    Reshape(Layout, Layout),
    #[error("tensor layout error: layout {0} not match layout {1}")]
    Layout(Layout, Layout),
    #[error("tensor index error: index {0:?} is out of layout {1}")]
    Index(Vec<usize>, Layout),
    #[error("tensor reduce error: output must hold a single element, not {0}")]
    Reduce(usize),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A statically typed, copy-on-write view of a [`TensorArray`].
///
/// Cloning a tensor shares its array. The first mutable access through a view
/// whose array is shared (or read-only) forks a private array, so other views
/// never observe the mutation.
#[derive(Debug)]
pub struct Tensor<T> {
    array: Arc<TensorArray>,
    layout: Layout,
    mutated: AtomicBool,
    phantom: PhantomData<T>,
}

impl<T> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        Self {
            array: self.array.clone(),
            layout: self.layout.clone(),
            mutated: AtomicBool::new(self.mutated.load(Ordering::Relaxed)),
            phantom: PhantomData,
        }
    }
}

impl<T: Scalar> Tensor<T> {
    fn from_array(array: TensorArray, layout: Layout) -> Self {
        Self {
            array: Arc::new(array),
            layout,
            mutated: AtomicBool::new(false),
            phantom: PhantomData,
        }
    }

    fn check_contents(layout: &Layout, contents: &[T]) -> Result<(), TensorError> {
        match layout.size() == contents.len() {
            true => Ok(()),
            false => Err(TensorError::Create(layout.clone(), contents.len())),
        }
    }

    /// Create a tensor holding a copy of `contents`, stored in the order given by `layout`.
    pub fn create(layout: impl IntoLayout, contents: &[T]) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        Self::check_contents(&layout, contents)?;
        let array = TensorArray::from_bytes(T::DATA_TYPE, bytemuck::cast_slice(contents));
        Ok(Self::from_array(array, layout))
    }

    /// Create a tensor of zeros.
    #[inline]
    pub fn zeros(layout: impl IntoLayout) -> Self {
        let layout = layout.into_layout();
        let array = TensorArray::new(T::DATA_TYPE, layout.size());
        Self::from_array(array, layout)
    }

    /// Create a tensor of zeros with the same layout.
    #[inline]
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.layout())
    }

    /// Create a tensor over reference data. The data itself is never written;
    /// mutating the tensor forks a private copy first.
    pub fn reference(layout: impl IntoLayout, contents: &[T]) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        Self::check_contents(&layout, contents)?;
        let array = TensorArray::reference(T::DATA_TYPE, bytemuck::cast_slice(contents));
        Ok(Self::from_array(array, layout))
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.array.id()
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    /// Number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn array(&self) -> &Arc<TensorArray> {
        &self.array
    }

    /// Number of views sharing the array.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.array)
    }

    /// Returns `true` if no other view shares the array.
    #[inline]
    pub fn is_unique_reference(&self) -> bool {
        self.ref_count() == 1
    }

    /// Returns `true` if both views share the same array.
    #[inline]
    pub fn is_alias_of<U>(&self, other: &Tensor<U>) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }

    /// A weak handle to the array, which does not keep it alive.
    #[inline]
    pub fn downgrade(&self) -> Weak<TensorArray> {
        Arc::downgrade(&self.array)
    }

    /// Returns `true` if the last access through this view had to fork a private array.
    /// Read accesses never fork, so they reset it.
    #[inline]
    pub fn last_access_mutated_view(&self) -> bool {
        self.mutated.load(Ordering::Relaxed)
    }

    /// Returns `true` if the last access to the array had to copy a replica.
    #[inline]
    pub fn last_access_copied_buffer(&self) -> bool {
        self.array.last_access_copied_buffer()
    }

    /// Reshape the tensor, leaving the underlying data untouched.
    #[inline]
    pub fn reshape(mut self, layout: impl IntoLayout) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        if self.layout.size() != layout.size() {
            return Err(TensorError::Reshape(self.layout(), layout));
        }
        self.layout = layout;
        Ok(self)
    }

    /// Returns an error if the tensor's layout doesn't match `layout`.
    #[inline]
    pub fn check_layout(&self, layout: &Layout) -> Result<(), TensorError> {
        match self.layout == *layout {
            true => Ok(()),
            false => Err(TensorError::Layout(self.layout(), layout.clone())),
        }
    }

    /// Gives the view a private array if it shares one or the array is read-only.
    ///
    /// Returns `true` if a fork took place.
    pub fn make_unique(&mut self, access: Access) -> Result<bool, TensorError> {
        let mutated = !self.is_unique_reference() || self.array.is_read_only();
        self.mutated.store(mutated, Ordering::Relaxed);
        if mutated {
            let array = self.array.fork(access)?;
            log::debug!(
                target: category::DATA_MUTATION,
                "mutate Tensor TensorArray({}) → TensorArray({})",
                self.array.id(),
                array.id()
            );
            self.array = Arc::new(array);
        }
        Ok(mutated)
    }

    /// Grants read access to the data in the memory space of `queue`'s device, or the host's.
    pub fn read_only(&self, queue: Option<&Queue>) -> Result<DeviceBuffer, TensorError> {
        self.mutated.store(false, Ordering::Relaxed);
        let buffer = self.array.request_access(queue, Access::ReadOnly)?;
        Ok(buffer)
    }

    /// Grants read and write access to up-to-date data, forking the array if it is shared.
    pub fn read_write(&mut self, queue: Option<&Queue>) -> Result<DeviceBuffer, TensorError> {
        self.make_unique(Access::ReadWrite)?;
        let buffer = self.array.request_access(queue, Access::ReadWrite)?;
        Ok(buffer)
    }

    /// Grants write access without bringing the data up to date.
    /// The contents are unspecified until overwritten.
    pub fn write_only(&mut self, queue: Option<&Queue>) -> Result<DeviceBuffer, TensorError> {
        self.make_unique(Access::WriteOnly)?;
        let buffer = self.array.request_access(queue, Access::WriteOnly)?;
        Ok(buffer)
    }

    /// Reads all elements on the host, in logical row-major order.
    pub fn to_vec(&self) -> Result<Vec<T>, TensorError> {
        let buffer = self.read_only(None)?;
        let data = buffer.read_slice::<T>();
        Ok(self.layout.offsets().map(|offset| data[offset]).collect())
    }

    /// Reads one element on the host.
    pub fn value(&self, index: &[usize]) -> Result<T, TensorError> {
        let offset = self.offset(index)?;
        let buffer = self.read_only(None)?;
        let value = buffer.read_slice::<T>()[offset];
        Ok(value)
    }

    /// Writes one element on the host.
    pub fn set(&mut self, value: T, index: &[usize]) -> Result<(), TensorError> {
        let offset = self.offset(index)?;
        let buffer = self.read_write(None)?;
        buffer.write_slice::<T>()[offset] = value;
        Ok(())
    }

    fn offset(&self, index: &[usize]) -> Result<usize, TensorError> {
        self.layout
            .offset(index)
            .ok_or_else(|| TensorError::Index(index.to_vec(), self.layout()))
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use itertools::Itertools;

    use super::{Tensor, TensorError};
    use crate::loom::{
        device::{DeviceKind, MemorySpace},
        layout::{Layout, Order},
        platform::Platform,
    };

    #[test]
    fn test_mutate_on_write() -> Result<(), Box<dyn Error>> {
        let mut a = Tensor::create([3], &[1.0f32, 2.0, 3.0])?;
        assert!(a.is_unique_reference());

        // unique, so no fork
        a.read_write(None)?;
        assert!(!a.last_access_mutated_view());

        let mut b = a.clone();
        assert!(!a.is_unique_reference());
        assert!(b.is_alias_of(&a));
        assert_eq!(a.ref_count(), 2);

        // reading never forks
        b.read_only(None)?;
        assert!(b.is_alias_of(&a));

        b.read_write(None)?;
        assert!(b.last_access_mutated_view());
        assert!(!b.is_alias_of(&a));
        assert!(a.is_unique_reference());
        assert!(b.is_unique_reference());

        // a later read reports no fork
        b.read_only(None)?;
        assert!(!b.last_access_mutated_view());

        b.set(7.0, &[1])?;
        assert!(!b.last_access_mutated_view());
        assert_eq!(b.to_vec()?, vec![1.0, 7.0, 3.0]);
        assert_eq!(a.to_vec()?, vec![1.0, 2.0, 3.0]);
        assert!(!a.last_access_mutated_view());
        Ok(())
    }

    #[test]
    fn test_read_only_idempotent() -> Result<(), Box<dyn Error>> {
        let platform = Platform::builder().test_devices(1).build();
        let queue = platform.devices()[1]
            .queue("q0")
            .timeout(Duration::from_secs(10))
            .build()?;

        let tensor = Tensor::create([2, 2], &[1u32, 2, 3, 4])?;
        tensor.read_only(None)?;
        assert!(!tensor.last_access_copied_buffer());

        tensor.read_only(Some(&queue))?;
        assert!(tensor.last_access_copied_buffer());
        tensor.read_only(Some(&queue))?;
        assert!(!tensor.last_access_copied_buffer());
        Ok(())
    }

    #[test]
    fn test_write_through_device() -> Result<(), Box<dyn Error>> {
        let platform = Platform::builder().test_devices(1).build();
        let queue = platform.devices()[1]
            .queue("q0")
            .timeout(Duration::from_secs(10))
            .build()?;

        let mut tensor = Tensor::<u32>::zeros([4]);
        let view = tensor.clone();
        let buffer = tensor.write_only(Some(&queue))?;
        assert!(tensor.last_access_mutated_view());
        assert_eq!(tensor.array().master(), queue.device().memory_space());

        queue.delay(Duration::from_millis(20))?;
        queue.upload(&buffer, bytemuck::cast_slice::<u32, u8>(&[4, 3, 2, 1]).to_vec())?;

        // the host read waits for the queue and copies the replica back
        assert_eq!(tensor.to_vec()?, vec![4, 3, 2, 1]);
        assert!(tensor.last_access_copied_buffer());
        assert_eq!(tensor.array().master(), queue.device().memory_space());
        assert_eq!(view.to_vec()?, vec![0; 4]);
        assert_eq!(view.array().master(), MemorySpace::Host);
        Ok(())
    }

    #[test]
    fn test_column_major() -> Result<(), Box<dyn Error>> {
        let layout = Layout::with_order([3, 2], Order::ColumnMajor);
        let tensor = Tensor::create(layout, &[0u8, 2, 4, 1, 3, 5])?;
        assert_eq!(tensor.to_vec()?, (0..6).collect_vec());
        assert_eq!(tensor.value(&[0, 1])?, 1);
        assert_eq!(tensor.value(&[2, 0])?, 4);

        let tensor = Tensor::create([3, 2], &[0u8, 1, 2, 3, 4, 5])?;
        assert_eq!(tensor.value(&[2, 0])?, 4);
        Ok(())
    }

    #[test]
    fn test_reference() -> Result<(), Box<dyn Error>> {
        let contents = [1i32, -2, 3, -4];
        let reference = Tensor::reference([4], &contents)?;
        assert!(reference.array().is_read_only());

        let mut tensor = reference.clone();
        tensor.set(0, &[0])?;
        assert!(tensor.last_access_mutated_view());
        assert!(!tensor.array().is_read_only());
        assert_eq!(tensor.to_vec()?, vec![0, -2, 3, -4]);
        assert_eq!(reference.to_vec()?, contents.to_vec());

        // a sole view of reference data forks too
        let mut tensor = Tensor::reference([4], &contents)?;
        assert!(tensor.is_unique_reference());
        tensor.read_write(None)?;
        assert!(tensor.last_access_mutated_view());
        Ok(())
    }

    #[test]
    fn test_reshape() -> Result<(), Box<dyn Error>> {
        let tensor = Tensor::create([2, 3], &[0u16, 1, 2, 3, 4, 5])?;
        let view = tensor.clone().reshape([3, 2])?;
        assert!(view.is_alias_of(&tensor));
        assert_eq!(view.value(&[2, 1])?, 5);
        assert!(view.check_layout(&Layout::from_shape([3, 2])).is_ok());
        assert!(matches!(
            view.check_layout(&tensor.layout()),
            Err(TensorError::Layout(_, _))
        ));

        assert!(matches!(
            tensor.clone().reshape([4]),
            Err(TensorError::Reshape(_, _))
        ));
        assert!(matches!(
            Tensor::create([4], &[0u16; 3]),
            Err(TensorError::Create(_, 3))
        ));
        assert!(matches!(
            tensor.value(&[2, 0]),
            Err(TensorError::Index(_, _))
        ));
        Ok(())
    }

    #[test]
    fn test_copy_on_write_stress() -> Result<(), Box<dyn Error>> {
        const COUNT: usize = 64;

        let contents = (0..COUNT as u32).collect_vec();
        let base = Tensor::create([COUNT], &contents[..])?;
        for step in 0..500 {
            let index = step % COUNT;
            let mut copy = base.clone();
            assert!(copy.is_alias_of(&base));

            copy.set(u32::MAX, &[index])?;
            assert!(copy.last_access_mutated_view());
            assert!(!copy.is_alias_of(&base));
            assert_eq!(copy.value(&[index])?, u32::MAX);
            assert_eq!(base.value(&[index])?, index as u32);

            let weak = copy.downgrade();
            drop(copy);
            assert!(weak.upgrade().is_none(), "step {step}: forked array leaked");
            assert_eq!(base.ref_count(), 1);
        }
        assert_eq!(base.to_vec()?, contents);
        Ok(())
    }

    #[test]
    fn test_async_host_cpu() -> Result<(), Box<dyn Error>> {
        let platform = Platform::builder().cpu(DeviceKind::CpuAsync).build();
        let queue = platform.host().queue("q0").build()?;

        let mut tensor = Tensor::create([4], &[1.0f32; 4])?;
        let buffer = tensor.read_write(Some(&queue))?;
        assert!(!tensor.last_access_copied_buffer());
        queue.enqueue("double", move || {
            buffer.write_slice::<f32>().iter_mut().for_each(|x| *x *= 2.0);
            Ok(())
        })?;
        assert_eq!(tensor.to_vec()?, vec![2.0; 4]);
        Ok(())
    }
}
