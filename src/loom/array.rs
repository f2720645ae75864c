//! The coherence ledger of one logical tensor's bytes.
//!
//! A [`TensorArray`] owns one replica per [`MemorySpace`] that has ever been accessed.
//! Exactly one replica is the *master*, holding the most recently written data;
//! every other replica is either valid (equal to the master) or stale.
//!
//! Access is requested through [`TensorArray::request_access`]:
//! 1. The target memory space is the host if no queue is given, else the queue's device's space.
//! 2. A missing replica is allocated lazily.
//! 3. A stale replica is refreshed by copying from the master on the requesting queue.
//! 4. A mutable access makes the target the master and marks every other replica stale.
//!
//! The ledger does not order two mutable accesses issued from different queues;
//! callers keep at most one in-flight mutable access per array.

use std::sync::Mutex;

use derive_more::{Deref, Display};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    category,
    device::{DeviceBuffer, MemorySpace, Queue, QueueError, queue::QueueHandle},
    num::DataType,
    ops::Access,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorId(uuid::Uuid);

impl Default for TensorId {
    #[inline]
    fn default() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

/// Freshness of a replica relative to the master.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReplicaState {
    Absent,
    Valid,
    Stale,
}

#[derive(Debug)]
struct Replica {
    buffer: DeviceBuffer,
    valid: bool,
    /// The queue that last wrote into this replica. `None` means the host,
    /// which writes synchronously.
    writer: Option<QueueHandle>,
    /// Queues granted reads of the current contents since the last write.
    readers: Vec<QueueHandle>,
}

impl Replica {
    fn new(buffer: DeviceBuffer, valid: bool) -> Self {
        Self {
            buffer,
            valid,
            writer: None,
            readers: Vec::new(),
        }
    }

    fn add_reader(&mut self, reader: &QueueHandle) {
        if self.readers.iter().all(|other| other.id() != reader.id()) {
            self.readers.push(reader.clone());
        }
    }
}

#[derive(Debug)]
struct ArrayState {
    replicas: HashMap<MemorySpace, Replica>,
    master: MemorySpace,
    last_access_copied_buffer: bool,
}

#[derive(Debug)]
pub struct TensorArray {
    id: TensorId,
    r#type: DataType,
    count: usize,
    read_only: bool,
    state: Mutex<ArrayState>,
}

impl Drop for TensorArray {
    fn drop(&mut self) {
        log::debug!(target: category::DATA_ALLOC, "release TensorArray({})", self.id);
    }
}

impl TensorArray {
    fn with_host(r#type: DataType, count: usize, host: DeviceBuffer) -> Self {
        let id = TensorId::default();
        let read_only = host.is_read_only();
        log::debug!(
            target: category::DATA_ALLOC,
            "create TensorArray({id}) {count}x{} on host",
            r#type
        );

        let mut replicas = HashMap::default();
        let master = MemorySpace::Host;
        replicas.insert(master, Replica::new(host, true));

        let state = Mutex::new(ArrayState {
            replicas,
            master,
            last_access_copied_buffer: false,
        });
        Self {
            id,
            r#type,
            count,
            read_only,
            state,
        }
    }

    /// Creates a zero-filled array of `count` elements.
    pub fn new(r#type: DataType, count: usize) -> Self {
        let host = DeviceBuffer::new(MemorySpace::Host, count * r#type.size());
        Self::with_host(r#type, count, host)
    }

    /// Creates an array holding a copy of `contents`.
    ///
    /// # Panics
    /// Panics if the length of `contents` is not a multiple of the element size.
    pub fn from_bytes(r#type: DataType, contents: &[u8]) -> Self {
        let count = Self::count_of(r#type, contents);
        let host = DeviceBuffer::from_bytes(MemorySpace::Host, contents);
        Self::with_host(r#type, count, host)
    }

    /// Creates an array over reference data which never accepts write access.
    ///
    /// # Panics
    /// Panics if the length of `contents` is not a multiple of the element size.
    pub fn reference(r#type: DataType, contents: &[u8]) -> Self {
        let count = Self::count_of(r#type, contents);
        let host = DeviceBuffer::from_bytes(MemorySpace::Host, contents).to_read_only();
        Self::with_host(r#type, count, host)
    }

    fn count_of(r#type: DataType, contents: &[u8]) -> usize {
        assert_eq!(
            contents.len() % r#type.size(),
            0,
            "contents length must be a multiple of {}'s size",
            r#type
        );
        contents.len() / r#type.size()
    }

    #[inline]
    fn state(&self) -> std::sync::MutexGuard<'_, ArrayState> {
        self.state.lock().expect("failed to lock")
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// Number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.count * self.r#type.size()
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The memory space holding the master replica.
    #[inline]
    pub fn master(&self) -> MemorySpace {
        self.state().master
    }

    #[inline]
    pub fn replica_state(&self, space: MemorySpace) -> ReplicaState {
        match self.state().replicas.get(&space) {
            None => ReplicaState::Absent,
            Some(replica) if replica.valid => ReplicaState::Valid,
            Some(_) => ReplicaState::Stale,
        }
    }

    /// A read-only handle to the replica in `space`, without synchronizing it.
    #[inline]
    pub fn replica(&self, space: MemorySpace) -> Option<DeviceBuffer> {
        self.state()
            .replicas
            .get(&space)
            .map(|replica| replica.buffer.to_read_only())
    }

    /// Memory spaces holding a replica.
    pub fn spaces(&self) -> Vec<MemorySpace> {
        self.state().replicas.keys().copied().collect()
    }

    /// Returns `true` if the last access had to copy data into the target replica.
    #[inline]
    pub fn last_access_copied_buffer(&self) -> bool {
        self.state().last_access_copied_buffer
    }

    /// Grants access to the replica in the memory space of `queue`'s device, or the host's.
    ///
    /// A stale replica is refreshed on `queue` (or synchronously, on the host) before
    /// the buffer is returned. Work submitted to `queue` afterwards observes the refreshed data.
    ///
    /// # Panics
    /// Panics if a mutable access is requested on a read-only array,
    /// or if `queue` is used off its creator thread.
    #[cfg_attr(
        feature = "trace",
        tracing::instrument(skip_all, fields(id = %self.id, access = %access))
    )]
    pub fn request_access(
        &self,
        queue: Option<&Queue>,
        access: Access,
    ) -> Result<DeviceBuffer, QueueError> {
        assert!(
            !(self.read_only && access.is_mutable()),
            "cannot grant write access to read only TensorArray({})",
            self.id
        );
        if let Some(queue) = queue {
            queue.check_thread();
            queue.check_error()?;
        }
        let space = queue.map_or(MemorySpace::Host, |queue| queue.device().memory_space());

        let mut guard = self.state();
        let state = &mut *guard;
        let master = state.master;

        let replica = state
            .replicas
            .entry(space)
            .or_insert_with(|| Replica::new(DeviceBuffer::new(space, self.size()), false));
        let target = replica.buffer.clone();
        let copy = !replica.valid && access.is_readable();

        // pending writes into the replicas read here must land first
        let writers = [Some(space), copy.then_some(master)]
            .into_iter()
            .flatten()
            .filter_map(|space| state.replicas[&space].writer.as_ref());
        // and pending reads of the replica overwritten here must finish first
        let readers = (copy || access.is_mutable())
            .then(|| state.replicas[&space].readers.iter())
            .into_iter()
            .flatten();
        let fences = writers
            .chain(readers)
            .filter(|other| queue.is_none_or(|queue| queue.id() != other.id()))
            .unique_by(|other| other.id())
            .map(QueueHandle::fence)
            .collect_vec();
        for fence in fences {
            match queue {
                Some(queue) => queue.enqueue_wait(fence)?,
                None => fence.wait()?,
            }
        }

        let handle = queue.map(Queue::handle);
        if copy {
            let source = state.replicas[&master].buffer.clone();
            log::debug!(
                target: category::DATA_COPY,
                "copy TensorArray({}) {master} → {space}",
                self.id
            );
            match queue {
                Some(queue) => queue.copy(&target, &source)?,
                None => target.copy_from(&source),
            }
            if let (Some(handle), Some(replica)) = (&handle, state.replicas.get_mut(&master)) {
                replica.add_reader(handle);
            }
        }
        state.last_access_copied_buffer = copy;

        if access.is_mutable() {
            state
                .replicas
                .iter_mut()
                .for_each(|(&other, replica)| replica.valid = other == space);
            if master != space {
                log::debug!(
                    target: category::DATA_MUTATION,
                    "master TensorArray({}) {master} → {space}",
                    self.id
                );
            }
            state.master = space;
        }
        if let Some(replica) = state.replicas.get_mut(&space) {
            replica.valid = true;
            if copy || access.is_mutable() {
                replica.writer = handle.clone();
                replica.readers.clear();
            }
            if let (Some(handle), false) = (&handle, access.is_mutable()) {
                replica.add_reader(handle);
            }
        }

        Ok(target.grant(access))
    }

    /// Creates a new array holding a copy of the master replica on the host.
    ///
    /// The bytes are not copied if `access` is [`Access::WriteOnly`].
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(id = %self.id)))]
    pub fn fork(&self, access: Access) -> Result<Self, QueueError> {
        let state = self.state();
        let host = match access.is_readable() {
            true => {
                let master = &state.replicas[&state.master];
                if let Some(writer) = &master.writer {
                    writer.fence().wait()?;
                }
                let source = &master.buffer;
                DeviceBuffer::from_bytes(MemorySpace::Host, &source.read())
            }
            false => DeviceBuffer::new(MemorySpace::Host, self.size()),
        };
        let array = Self::with_host(self.r#type, self.count, host);
        log::debug!(
            target: category::DATA_MUTATION,
            "fork TensorArray({}) → TensorArray({})",
            self.id,
            array.id
        );
        Ok(array)
    }
}
