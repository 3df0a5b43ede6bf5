//! The [crate::ring] module is the queue engine, a thin and strictly accounted layer on top of
//! [io_uring::IoUring]. It distills the kernel interface down to four pieces:
//! - The [Op] type which describes a single staged operation, built from one of its constructors.
//! - The [Ring] which stages operations, submits them in batches and hands out completions.
//! - The [Completion] which is a move only view of a finished operation that has to be given back
//! to the [Ring] via [Ring::acknowledge].
//! - The [Features] snapshot of what the running kernel supports.
//!
//! The [Ring] does no locking and no correlation of its own, the `u64` token supplied with every
//! operation comes back untouched on its completion. See [crate::correlation] for turning those
//! tokens back into requests and [crate::service] for a ready made waiter loop.

mod completion;
mod engine;
mod features;
mod op;

pub(crate) use completion::check;
pub use completion::Completion;
pub use engine::{Ring, RingBuilder};
pub use features::Features;
pub use op::{Op, OpInfo, OpKind};
