//! Building blocks for the client side of an audio stream connection.
//!
//! - [`smoother`] turns sparse, noisy clock samples into a smooth,
//!   monotonic interpolated clock.
//! - [`memblock`] provides reference counted audio blocks and the pools
//!   that hand them out.
//! - [`queue`] is the byte queue that buffers received record data until
//!   the application consumes it.

pub mod memblock;
pub mod queue;
pub mod smoother;

pub use memblock::{HeapPool, MemChunk, MemPool};
pub use queue::{BlockQueue, QueueError};
pub use smoother::{Smoother, SmootherConfig};
