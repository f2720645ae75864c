use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicUsize, Ordering},
};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use buffer::{BufferId, DeviceBuffer, ReadSlice, WriteSlice};
pub use event::{EventId, EventOptions, QueueEvent};
pub use queue::{Queue, QueueBuilder, QueueError, QueueId};

use queue::QueueShared;

pub mod buffer;
pub mod event;
pub mod queue;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceId(pub usize);

/// The physical address space a replica lives in.
///
/// Two devices share memory iff their memory spaces are equal, in which case
/// they also share a single replica of every tensor array.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemorySpace {
    #[display("host")]
    Host,
    #[display("device:{_0}")]
    Device(DeviceId),
}

/// How the queues of a device execute their work.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceKind {
    /// Work runs inline on the calling thread.
    #[default]
    CpuSync,
    /// Work runs in submission order on a dedicated worker thread per queue.
    CpuAsync,
}

/// Whether a device addresses host memory directly.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemoryKind {
    /// The device reads and writes host memory.
    #[default]
    Unified,
    /// The device owns separate memory; data must be copied in and out.
    Discrete,
}

/// Called whenever an error is reported into one of the device's queues.
pub type ErrorHandler = Arc<dyn Fn(&Device, &QueueError) + Send + Sync>;

struct DeviceInner {
    id: DeviceId,
    name: String,
    kind: DeviceKind,
    memory: MemoryKind,
    handler: Option<ErrorHandler>,
    queues: Mutex<Vec<Weak<QueueShared>>>,
    next_queue: AtomicUsize,
}

/// A compute device. Supplies queues and collects the errors they raise.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .field("memory", &self.0.memory)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Device {}

impl Device {
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.0.kind
    }

    #[inline]
    pub fn memory(&self) -> MemoryKind {
        self.0.memory
    }

    /// The address space replicas accessed through this device live in.
    #[inline]
    pub fn memory_space(&self) -> MemorySpace {
        match self.0.memory {
            MemoryKind::Unified => MemorySpace::Host,
            MemoryKind::Discrete => MemorySpace::Device(self.0.id),
        }
    }

    /// Returns `true` if both devices address the same physical memory.
    #[inline]
    pub fn shares_memory_with(&self, other: &Device) -> bool {
        self.memory_space() == other.memory_space()
    }

    /// Starts building a queue on this device.
    ///
    /// The queue is bound to the thread that calls [`QueueBuilder::build`].
    #[inline]
    pub fn queue(&self, name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(self.clone(), name.into())
    }

    pub(crate) fn register(&self, queue: &Arc<QueueShared>) -> usize {
        let mut queues = self.0.queues.lock().expect("failed to lock");
        queues.retain(|queue| queue.strong_count() > 0);
        queues.push(Arc::downgrade(queue));
        self.0.next_queue.fetch_add(1, Ordering::Relaxed)
    }

    /// Puts `queue` into the error state. Callable from any thread.
    pub(crate) fn report(&self, queue: &QueueShared, error: QueueError) {
        log::error!("{} {}: {error}", self.name(), queue.label());
        if let Some(handler) = &self.0.handler {
            handler(self, &error);
        }
        queue.set_error(error);
    }

    /// Clears the error state of every live queue of this device.
    pub fn clear_errors(&self) {
        let queues = self.0.queues.lock().expect("failed to lock");
        queues
            .iter()
            .filter_map(Weak::upgrade)
            .for_each(|queue| queue.clear_error());
    }
}

#[derive(Default, Clone)]
pub struct DeviceBuilder {
    pub id: DeviceId,
    pub name: Option<String>,
    pub kind: DeviceKind,
    pub memory: MemoryKind,
    pub handler: Option<ErrorHandler>,
}

impl DeviceBuilder {
    pub fn new(id: usize) -> Self {
        let id = DeviceId(id);
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Device, &QueueError) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Device {
        let Self {
            id,
            name,
            kind,
            memory,
            handler,
        } = self;
        let name = name.unwrap_or_else(|| format!("cpu:{id}"));
        let queues = Mutex::new(Vec::new());
        let next_queue = AtomicUsize::new(0);
        Device(Arc::new(DeviceInner {
            id,
            name,
            kind,
            memory,
            handler,
            queues,
            next_queue,
        }))
    }
}
