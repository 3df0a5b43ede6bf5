use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use thread_local::ThreadLocal;
use tracing::debug;

use crate::{ring::Ring, Result};

use super::THREAD_RING_DEPTH;

/// Represents a handle to the per thread [Ring]s. Each thread asking for a ring gets its own,
/// built on first use with a depth of [THREAD_RING_DEPTH]. It is generally not a good idea to
/// create this manually, in fact you cannot do so directly and instead should leverage either
/// [super::handle] or [super::ring] to get access to one of these.
#[derive(Clone)]
pub struct Handle {
    rings: Arc<ThreadLocal<Mutex<Ring>>>,
}

impl Handle {
    pub(super) fn new() -> Handle {
        Handle {
            rings: Arc::new(ThreadLocal::new()),
        }
    }

    /// Return the calling thread's ring, setting it up first if this thread never asked before.
    /// A failed setup is returned and retried on the next call.
    pub fn ring(&self) -> Result<MutexGuard<'_, Ring>> {
        let ring = self.rings.get_or_try(|| {
            let ring = Ring::new(THREAD_RING_DEPTH)?;
            debug!(ring = ring.id(), "created thread local ring");
            Ok::<_, crate::Error>(Mutex::new(ring))
        })?;
        Ok(ring
            .lock()
            .expect("failed to take thread local ring lock: poisoned"))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
