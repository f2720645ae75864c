use std::{
    marker::PhantomData,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytemuck::Pod;
use derive_more::{Deref, Display};

use super::MemorySpace;
use crate::loom::{category, ops::Access};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BufferId(uid::Id<BufferId>);

/// Word-aligned byte storage, so that every [`Scalar`](crate::loom::num::Scalar) can be viewed in place.
#[derive(Debug)]
struct Storage {
    id: BufferId,
    words: Box<[u64]>,
    len: usize,
}

impl Storage {
    fn zeroed(id: BufferId, len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(size_of::<u64>())].into_boxed_slice();
        Self { id, words, len }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        log::debug!(
            target: category::DATA_ALLOC,
            "release DeviceBuffer({}) {} bytes",
            self.id,
            self.len
        );
    }
}

/// A fixed-length allocation living in one [`MemorySpace`].
///
/// Cloning a buffer clones the handle, not the bytes. A handle may be read-only,
/// in which case it never grants write access to the shared storage.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    id: BufferId,
    space: MemorySpace,
    len: usize,
    read_only: bool,
    storage: Arc<RwLock<Storage>>,
}

impl DeviceBuffer {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn new(space: MemorySpace, len: usize) -> Self {
        let id = BufferId::default();
        log::debug!(
            target: category::DATA_ALLOC,
            "alloc DeviceBuffer({id}) {len} bytes on {space}"
        );
        let storage = Arc::new(RwLock::new(Storage::zeroed(id, len)));
        Self {
            id,
            space,
            len,
            read_only: false,
            storage,
        }
    }

    /// Allocates a buffer holding a copy of `contents`.
    pub fn from_bytes(space: MemorySpace, contents: &[u8]) -> Self {
        let buffer = Self::new(space, contents.len());
        buffer.write().copy_from_slice(contents);
        buffer
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn space(&self) -> MemorySpace {
        self.space
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns a read-only handle to the same storage.
    #[inline]
    pub fn to_read_only(&self) -> Self {
        Self {
            read_only: true,
            ..self.clone()
        }
    }

    /// Returns a handle whose writability matches `access`.
    #[inline]
    pub(crate) fn grant(&self, access: Access) -> Self {
        match access {
            Access::ReadOnly => self.to_read_only(),
            Access::ReadWrite | Access::WriteOnly => {
                assert!(
                    !self.read_only,
                    "cannot grant write access to read only buffer {}",
                    self.id
                );
                self.clone()
            }
        }
    }

    /// Returns `true` if both handles refer to the same storage.
    #[inline]
    pub fn shares_storage(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    #[inline]
    pub fn read(&self) -> ReadSlice<'_, u8> {
        self.read_slice()
    }

    #[inline]
    pub fn read_slice<T: Pod>(&self) -> ReadSlice<'_, T> {
        let guard = self.storage.read().expect("failed to lock");
        let phantom = PhantomData;
        ReadSlice { guard, phantom }
    }

    /// # Panics
    /// Panics if the handle is read-only.
    #[inline]
    pub fn write(&self) -> WriteSlice<'_, u8> {
        self.write_slice()
    }

    /// # Panics
    /// Panics if the handle is read-only.
    #[inline]
    pub fn write_slice<T: Pod>(&self) -> WriteSlice<'_, T> {
        assert!(
            !self.read_only,
            "cannot mutate read only buffer {}",
            self.id
        );
        let guard = self.storage.write().expect("failed to lock");
        let phantom = PhantomData;
        WriteSlice { guard, phantom }
    }

    /// Copies all bytes of `other` into this buffer.
    ///
    /// # Panics
    /// Panics if this handle is read-only or the lengths differ.
    pub fn copy_from(&self, other: &DeviceBuffer) {
        assert!(!self.read_only, "cannot mutate read only buffer {}", self.id);
        assert_eq!(self.len, other.len, "buffer sizes don't match");
        if self.shares_storage(other) {
            return;
        }
        let source = other.read();
        self.write().copy_from_slice(&source);
    }

    /// Copies host bytes into this buffer.
    ///
    /// # Panics
    /// Panics if this handle is read-only or the lengths differ.
    pub fn copy_from_slice(&self, contents: &[u8]) {
        assert!(!self.read_only, "cannot mutate read only buffer {}", self.id);
        assert_eq!(self.len, contents.len(), "buffer sizes don't match");
        self.write().copy_from_slice(contents);
    }

    /// Copies this buffer's bytes into host memory.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn copy_to_slice(&self, output: &mut [u8]) {
        assert_eq!(self.len, output.len(), "buffer sizes don't match");
        output.copy_from_slice(&self.read());
    }

    /// Fills the buffer with zero bytes.
    ///
    /// # Panics
    /// Panics if this handle is read-only.
    pub fn zero(&self) {
        self.write().fill(0);
    }
}

/// Scoped shared access to a buffer's contents viewed as `[T]`.
#[derive(Debug)]
pub struct ReadSlice<'a, T> {
    guard: RwLockReadGuard<'a, Storage>,
    phantom: PhantomData<T>,
}

impl<T: Pod> std::ops::Deref for ReadSlice<'_, T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        bytemuck::cast_slice(self.guard.bytes())
    }
}

/// Scoped exclusive access to a buffer's contents viewed as `[T]`.
#[derive(Debug)]
pub struct WriteSlice<'a, T> {
    guard: RwLockWriteGuard<'a, Storage>,
    phantom: PhantomData<T>,
}

impl<T: Pod> std::ops::Deref for WriteSlice<'_, T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        bytemuck::cast_slice(self.guard.bytes())
    }
}

impl<T: Pod> std::ops::DerefMut for WriteSlice<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        bytemuck::cast_slice_mut(self.guard.bytes_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceBuffer;
    use crate::loom::device::{DeviceId, MemorySpace};

    #[test]
    fn test_typed_view() {
        let buffer = DeviceBuffer::new(MemorySpace::Host, 6 * size_of::<f32>());
        buffer
            .write_slice::<f32>()
            .iter_mut()
            .enumerate()
            .for_each(|(index, x)| *x = index as f32);
        assert_eq!(&buffer.read_slice::<f32>()[..], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        buffer.zero();
        assert!(buffer.read().iter().all(|&x| x == 0));
    }

    #[test]
    fn test_copy() {
        let space = MemorySpace::Device(DeviceId(1));
        let x = DeviceBuffer::from_bytes(MemorySpace::Host, &[1, 2, 3, 4, 5]);
        let y = DeviceBuffer::new(space, 5);
        y.copy_from(&x);
        assert_eq!(&y.read()[..], &[1, 2, 3, 4, 5]);

        let mut output = [0u8; 5];
        y.copy_to_slice(&mut output);
        assert_eq!(output, [1, 2, 3, 4, 5]);

        // copying onto itself is a no-op
        let z = y.clone();
        z.copy_from(&y);
        assert_eq!(&z.read()[..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "cannot mutate read only buffer")]
    fn test_read_only_write() {
        let buffer = DeviceBuffer::new(MemorySpace::Host, 4).to_read_only();
        buffer.zero();
    }

    #[test]
    #[should_panic(expected = "buffer sizes don't match")]
    fn test_size_mismatch() {
        let x = DeviceBuffer::new(MemorySpace::Host, 4);
        let y = DeviceBuffer::new(MemorySpace::Host, 8);
        x.copy_from(&y);
    }
}
