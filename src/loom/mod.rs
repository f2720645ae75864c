//! The `loom` module keeps the bytes of logical tensors coherent across devices.
//!
//! ## Key Components
//! 1. **Queues and Events**:
//!    - A [`Queue`](device::Queue) is an ordered execution stream bound to the thread that built it.
//!    - A [`QueueEvent`](device::QueueEvent) is a one-shot signal ordering work within and across queues.
//!    - Each queue keeps a single error slot; once set, further work fails fast until cleared.
//!
//! 2. **Device Buffers**:
//!    - Fixed-length allocations in one [`MemorySpace`](device::MemorySpace), gated read-only or read-write.
//!
//! 3. **Coherence Ledger**:
//!    - A [`TensorArray`](array::TensorArray) tracks one replica per memory space and which one is the master.
//!    - Stale replicas are refreshed on demand, with copies ordered on the requesting queue.
//!
//! 4. **Tensor Views**:
//!    - A [`Tensor`](tensor::Tensor) shares its array with its clones and forks a private one on first write.
//!
//! Devices sharing host memory share the host replica, so data never moves between them.

pub mod array;
pub mod device;
pub mod layout;
pub mod num;
pub mod ops;
pub mod platform;
pub mod tensor;

/// Log targets of the diagnostic categories.
pub mod category {
    pub const QUEUE_ALLOC: &str = "loom::queue::alloc";
    pub const QUEUE_SYNC: &str = "loom::queue::sync";
    pub const DATA_ALLOC: &str = "loom::data::alloc";
    pub const DATA_COPY: &str = "loom::data::copy";
    pub const DATA_MUTATION: &str = "loom::data::mutation";
}
