use std::fmt;

use tracing::trace;

use crate::{Error, Result};

use super::selected_slot;

/// Ownership state of a single slot in a [BufferPool].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the application and zeroed, not known to the kernel.
    Idle,
    /// Handed to the kernel, which may write into it at any moment.
    Offered,
    /// Picked by the kernel for a completion, the application may read it until recycled.
    Selected,
}

/// A contiguous arena of `slot_count` buffers of `slot_size` bytes each, identified towards the
/// kernel by its group id.
///
/// The backing storage is boxed and never reallocated, so the addresses handed to the kernel stay
/// valid for as long as the pool itself is alive. It is up to the owner to keep the pool alive
/// while any of its slots are [SlotState::Offered].
pub struct BufferPool {
    group_id: u16,
    slot_size: usize,
    storage: Box<[u8]>,
    states: Vec<SlotState>,
}

impl BufferPool {
    /// Allocate a new zeroed pool. The pool is not known to the kernel until it has been provided
    /// through [crate::ring::Op::provide_buffers].
    pub fn new(slot_count: usize, slot_size: usize, group_id: u16) -> Result<BufferPool> {
        if slot_count == 0 || slot_size == 0 {
            return Err(Error::InvalidPool(format!(
                "slot count and size must be non zero, got {} slots of {} bytes",
                slot_count, slot_size
            )));
        }
        if slot_count > u16::MAX as usize {
            return Err(Error::InvalidPool(format!(
                "at most {} slots supported, got {}",
                u16::MAX,
                slot_count
            )));
        }
        if slot_size > i32::MAX as usize {
            return Err(Error::InvalidPool(format!(
                "slot size {} exceeds {}",
                slot_size,
                i32::MAX
            )));
        }
        let len = slot_count
            .checked_mul(slot_size)
            .ok_or_else(|| Error::InvalidPool("pool size overflows usize".into()))?;

        Ok(BufferPool {
            group_id,
            slot_size,
            storage: vec![0u8; len].into_boxed_slice(),
            states: vec![SlotState::Idle; slot_count],
        })
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    pub fn slot_count(&self) -> usize {
        self.states.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots the kernel currently owns.
    pub fn offered_count(&self) -> usize {
        self.states
            .iter()
            .filter(|state| **state == SlotState::Offered)
            .count()
    }

    pub fn state(&self, index: usize) -> Result<SlotState> {
        self.check(index)?;
        Ok(self.states[index])
    }

    /// Borrow the bytes of the given slot. Fails for out of range indices and for slots that are
    /// currently offered to the kernel.
    pub fn slot(&self, index: usize) -> Result<&[u8]> {
        self.owned(index)?;
        let start = index * self.slot_size;
        Ok(&self.storage[start..start + self.slot_size])
    }

    /// Mutably borrow the bytes of the given slot, see [BufferPool::slot].
    pub fn slot_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        self.owned(index)?;
        let start = index * self.slot_size;
        Ok(&mut self.storage[start..start + self.slot_size])
    }

    /// Take ownership of the slot the kernel picked for a completion, as reported by the
    /// completion's flags word.
    pub fn select(&mut self, flags: u32) -> Result<u16> {
        let index = selected_slot(flags).ok_or_else(|| {
            Error::InvalidPool(format!(
                "completion flags {:#x} carry no buffer selection for group {}",
                flags, self.group_id
            ))
        })?;
        self.check(index as usize)?;

        match self.states[index as usize] {
            SlotState::Offered => {
                self.states[index as usize] = SlotState::Selected;
                trace!(group = self.group_id, slot = index, "kernel selected buffer slot");
                Ok(index)
            }
            state => Err(Error::InvalidPool(format!(
                "kernel selected slot {} of group {} which was {:?}",
                index, self.group_id, state
            ))),
        }
    }

    /// Zero a slot. Only valid for slots the application owns.
    pub fn clear(&mut self, index: usize) -> Result<()> {
        self.slot_mut(index)?.fill(0);
        Ok(())
    }

    /// Mark every slot offered and return the arena base pointer for a provide-buffers request.
    /// Every slot has to be idle, a pool is only ever provided as a whole once.
    pub(crate) fn offer_all(&mut self) -> Result<*mut u8> {
        if let Some(index) = self.states.iter().position(|s| *s != SlotState::Idle) {
            return Err(Error::InvalidPool(format!(
                "slot {} of group {} is {:?}, the whole pool must be idle to provide it",
                index, self.group_id, self.states[index]
            )));
        }
        self.states.fill(SlotState::Offered);
        Ok(self.storage.as_mut_ptr())
    }

    /// Zero a single slot, mark it offered and return its address for a provide-buffers request.
    pub(crate) fn reoffer(&mut self, index: usize) -> Result<*mut u8> {
        let slot = self.slot_mut(index)?;
        slot.fill(0);
        let ptr = slot.as_mut_ptr();
        self.states[index] = SlotState::Offered;
        Ok(ptr)
    }

    /// Hand slots back to the application after the kernel rejected a provide request for them.
    pub(crate) fn reclaim(&mut self, index: Option<usize>) {
        match index {
            Some(index) if index < self.states.len() => self.states[index] = SlotState::Idle,
            Some(_) => {}
            None => self.states.fill(SlotState::Idle),
        }
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.states.len() {
            return Err(Error::InvalidSlot {
                index,
                slots: self.states.len(),
            });
        }
        Ok(())
    }

    fn owned(&self, index: usize) -> Result<()> {
        self.check(index)?;
        match self.states[index] {
            SlotState::Offered => Err(Error::SlotOffered { index }),
            SlotState::Idle | SlotState::Selected => Ok(()),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("group_id", &self.group_id)
            .field("slot_count", &self.slot_count())
            .field("slot_size", &self.slot_size)
            .field("offered", &self.offered_count())
            .finish()
    }
}
