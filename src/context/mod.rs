//! The context module hands every thread its own default [crate::ring::Ring]. A global [Handle]
//! stores one ring per thread in a [thread_local::ThreadLocal], created lazily on first use, so
//! code that just needs a ring can grab the calling thread's via [ring] instead of threading one
//! through every call. Rings are never shared, a ring only ever serves the thread that created it.
//!
//! Generally speaking you should NOT be creating [Handle] objects directly and instead should
//! leverage the above helpers to do so.

mod handle;
mod statics;

pub use handle::Handle;
pub use statics::{handle, ring};

/// Depth of the rings created for each thread.
pub const THREAD_RING_DEPTH: u32 = 256;
