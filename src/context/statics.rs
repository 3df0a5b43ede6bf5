use std::sync::MutexGuard;

use lazy_static::lazy_static;

use crate::{ring::Ring, Result};

use super::Handle;

lazy_static! {
    static ref HANDLE: Handle = Handle::new();
}

/// Return a reference to the global [Handle] object, which holds the rings of every thread that
/// asked for one.
pub fn handle() -> &'static Handle {
    &HANDLE
}

/// Return the calling thread's own [Ring], creating it on first use.
pub fn ring() -> Result<MutexGuard<'static, Ring>> {
    handle().ring()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{ring::Op, test_util::unavailable};

    fn thread_ring_id() -> Option<u64> {
        match ring() {
            Ok(ring) => Some(ring.id()),
            Err(ref err) if unavailable(err) => None,
            Err(err) => panic!("failed to set up thread ring: {}", err),
        }
    }

    #[test]
    fn test_ring_is_per_thread() {
        let Some(first) = thread_ring_id() else { return };
        assert_eq!(thread_ring_id(), Some(first));

        let other = thread::spawn(thread_ring_id).join().unwrap();
        assert!(other.is_some());
        assert_ne!(other, Some(first));
    }

    #[test]
    fn test_thread_ring_runs_operations() {
        let mut ring = match ring() {
            Ok(ring) => ring,
            Err(ref err) if unavailable(err) => return,
            Err(err) => panic!("failed to set up thread ring: {}", err),
        };
        assert_eq!(ring.depth(), super::super::THREAD_RING_DEPTH);

        // SAFETY: A nop references no memory.
        unsafe { ring.prepare(Op::nop(), 99).unwrap() };
        ring.submit().unwrap();
        let completion = ring.wait().unwrap();
        assert_eq!(completion.token(), 99);
        ring.acknowledge(completion);
        assert_eq!(ring.submitted_count(), 0);
    }
}
