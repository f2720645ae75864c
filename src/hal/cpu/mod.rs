//! Element-wise and reduction kernels executed by CPU queues.
//!
//! Every kernel obtains its buffers through the tensor accessors on the given queue and
//! enqueues the element loop there, so it is ordered after the copies the accessors issue.
//! Results are observable once the queue completes, or through another accessor call.

mod fill;
mod map;
mod reduce;

pub use fill::{fill, fill_with_index};
pub use map::{map, neg, zip_map};
pub use reduce::{product, reduce, sum};
