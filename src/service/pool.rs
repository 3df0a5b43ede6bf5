use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{buffer::BufferPool, Error, Result};

/// A shared handle to a [BufferPool] registered with a [super::RingService].
///
/// The waiter thread and the application both reach the pool through this handle, the pool's own
/// slot states decide who may touch which slot at any time. The service holds on to a clone of
/// every registered pool until its ring has been torn down.
///
/// Group ids are only unique per ring, so a handle remembers the ring it was created for and is
/// refused by any other service.
#[derive(Clone)]
pub struct PoolHandle {
    ring_id: u64,
    group_id: u16,
    pool: Arc<Mutex<BufferPool>>,
}

impl PoolHandle {
    pub(crate) fn new(pool: BufferPool, ring_id: u64) -> PoolHandle {
        PoolHandle {
            ring_id,
            group_id: pool.group_id(),
            pool: Arc::new(Mutex::new(pool)),
        }
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    /// Id of the ring the pool is registered with.
    pub fn ring_id(&self) -> u64 {
        self.ring_id
    }

    #[cfg(test)]
    pub(crate) fn holders(&self) -> usize {
        Arc::strong_count(&self.pool)
    }

    /// Fail with [Error::InvalidPool] unless the pool belongs to the ring `ring_id`.
    pub(crate) fn check_ring(&self, ring_id: u64) -> Result<()> {
        if self.ring_id != ring_id {
            return Err(Error::InvalidPool(format!(
                "group {} belongs to ring {}, not ring {}",
                self.group_id, self.ring_id, ring_id
            )));
        }
        Ok(())
    }

    pub fn lock(&self) -> MutexGuard<'_, BufferPool> {
        self.pool
            .lock()
            .expect("failed to lock buffer pool: poisoned")
    }

    /// Run `f` over the bytes of a slot the application owns.
    pub fn with_slot<R, F>(&self, slot: u16, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let pool = self.lock();
        let bytes = pool.slot(slot as usize)?;
        Ok(f(bytes))
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("ring_id", &self.ring_id)
            .field("group_id", &self.group_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_slot_respects_ownership() {
        let handle = PoolHandle::new(BufferPool::new(2, 8, 5).unwrap(), 0);
        assert_eq!(handle.group_id(), 5);
        assert_eq!(handle.with_slot(1, |bytes| bytes.len()).unwrap(), 8);

        handle.lock().offer_all().unwrap();
        assert!(matches!(
            handle.with_slot(1, |_| ()),
            Err(Error::SlotOffered { index: 1 })
        ));
        assert!(matches!(
            handle.with_slot(2, |_| ()),
            Err(Error::InvalidSlot { index: 2, slots: 2 })
        ));
    }

    #[test]
    fn test_pool_is_bound_to_its_ring() {
        let handle = PoolHandle::new(BufferPool::new(1, 8, 0).unwrap(), 3);
        assert_eq!(handle.ring_id(), 3);
        handle.check_ring(3).unwrap();
        assert!(matches!(handle.check_ring(4), Err(Error::InvalidPool(_))));
    }
}
