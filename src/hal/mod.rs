//! Kernels built on top of the tensor accessors.

pub mod cpu;
