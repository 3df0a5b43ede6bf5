//! Kernel selected buffer pools. A [BufferPool] is a single boxed arena carved up into equally
//! sized slots which are handed to the kernel in one provide-buffers request. Pool backed
//! operations then leave buffer choice to the kernel, which reports the slot it picked in the
//! completion flags, see [selected_slot].
//!
//! Every slot tracks who currently owns it through a [SlotState], the application can only look
//! at slots it owns and the kernel is only ever offered slots that were zeroed first.

mod pool;

pub use pool::{BufferPool, SlotState};

use io_uring::cqueue;

/// Decode the slot index the kernel selected for a pool backed completion from its flags word,
/// returning `None` when the completion did not consume a pool buffer.
pub fn selected_slot(flags: u32) -> Option<u16> {
    cqueue::buffer_select(flags)
}
