use std::fmt;

use io_uring::cqueue;
use tracing::error;

use crate::{buffer::selected_slot, Error, Result};

use super::OpInfo;

/// A read only view of a single finished operation.
///
/// A [Completion] can't be cloned and has to be handed back to the [super::Ring] it came from via
/// [super::Ring::acknowledge] exactly once, which consumes it. Dropping one without doing so leaks
/// an in flight slot in the ring's accounting and is reported as an error.
#[must_use = "completions must be acknowledged on the ring they came from"]
pub struct Completion {
    ring: u64,
    entry: cqueue::Entry,
    acknowledged: bool,
}

impl Completion {
    pub(super) fn new(ring: u64, entry: cqueue::Entry) -> Completion {
        Completion {
            ring,
            entry,
            acknowledged: false,
        }
    }

    /// The raw result, negative values are a negated errno.
    pub fn result(&self) -> i32 {
        self.entry.result()
    }

    pub fn flags(&self) -> u32 {
        self.entry.flags()
    }

    /// The token the operation was prepared with.
    pub fn token(&self) -> u64 {
        self.entry.user_data()
    }

    /// The buffer pool slot the kernel picked, for pool backed operations.
    pub fn buffer_slot(&self) -> Option<u16> {
        selected_slot(self.flags())
    }

    /// The non negative result of the operation, or the translated error.
    pub fn value(&self, info: OpInfo) -> Result<u32> {
        check(self.result(), info)
    }

    pub(super) fn ring_id(&self) -> u64 {
        self.ring
    }

    pub(super) fn disarm(mut self) {
        self.acknowledged = true;
    }
}

/// Translate a raw completion result into a value or the domain error for the operation.
pub(crate) fn check(result: i32, info: OpInfo) -> Result<u32> {
    if result >= 0 {
        return Ok(result as u32);
    }
    match info.group {
        Some(group) if -result == nix::libc::ENOBUFS => Err(Error::PoolExhausted { group }),
        _ => Err(Error::from_result(info.kind, info.fd, result)),
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token())
            .field("result", &self.result())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.acknowledged {
            error!(
                token = self.token(),
                result = self.result(),
                "completion dropped without being acknowledged"
            );
        }
    }
}
