use std::{
    fmt,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use io_uring::types::Timespec;
use nix::libc;
use tracing::warn;

use crate::{
    buffer::selected_slot,
    correlation::Token,
    ptr::IoVec,
    ring::{check, Op, OpInfo, OpKind, Ring},
    Result,
};

use super::PoolHandle;

/// An owned description of a single request for a [super::RingService].
///
/// Every buffer is moved into the request and handed back through the [Outcome], so nothing the
/// kernel writes to can be touched by the caller while the request is in flight.
pub enum Operation {
    Nop,
    /// Read into `buf` from `fd` at `offset`.
    Readv {
        fd: RawFd,
        buf: Vec<u8>,
        offset: u64,
    },
    /// Write all of `buf` to `fd` at `offset`.
    Writev {
        fd: RawFd,
        buf: Vec<u8>,
        offset: u64,
    },
    Accept {
        fd: RawFd,
    },
    Send {
        fd: RawFd,
        buf: Vec<u8>,
    },
    Recv {
        fd: RawFd,
        buf: Vec<u8>,
    },
    /// Receive into a slot of `pool` picked by the kernel.
    RecvPooled {
        fd: RawFd,
        pool: PoolHandle,
    },
    PollAdd {
        fd: RawFd,
        events: u32,
    },
    /// Offer every slot of an idle pool to the kernel.
    ProvideBuffers {
        pool: PoolHandle,
    },
    /// Zero a selected slot and offer it back to the kernel.
    Recycle {
        pool: PoolHandle,
        slot: u16,
    },
    /// A kernel timer, completes successfully once `duration` elapsed.
    Timeout {
        duration: Duration,
    },
}

/// The result of a successful [Operation] as delivered to its continuation.
#[derive(Debug)]
pub struct Outcome {
    pub token: Token,
    /// Byte count, accepted descriptor, or poll mask depending on the operation.
    pub value: u32,
    pub flags: u32,
    /// The pool slot the kernel selected for pool backed receives.
    pub slot: Option<u16>,
    /// The buffer the operation was submitted with, handed back untouched beyond what the kernel
    /// wrote.
    pub buf: Option<Vec<u8>>,
    /// The accepted connection.
    pub fd: Option<OwnedFd>,
}

impl Outcome {
    fn new(token: Token, value: u32, flags: u32) -> Outcome {
        Outcome {
            token,
            value,
            flags,
            slot: None,
            buf: None,
            fd: None,
        }
    }
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        use Operation::*;
        match self {
            Nop => OpKind::Nop,
            Readv { .. } => OpKind::Readv,
            Writev { .. } => OpKind::Writev,
            Accept { .. } => OpKind::Accept,
            Send { .. } => OpKind::Send,
            Recv { .. } | RecvPooled { .. } => OpKind::Recv,
            PollAdd { .. } => OpKind::PollAdd,
            ProvideBuffers { .. } | Recycle { .. } => OpKind::ProvideBuffers,
            Timeout { .. } => OpKind::Timeout,
        }
    }

    pub fn info(&self) -> OpInfo {
        use Operation::*;
        let fd = match self {
            Readv { fd, .. }
            | Writev { fd, .. }
            | Accept { fd }
            | Send { fd, .. }
            | Recv { fd, .. }
            | RecvPooled { fd, .. }
            | PollAdd { fd, .. } => Some(*fd),
            Nop | ProvideBuffers { .. } | Recycle { .. } | Timeout { .. } => None,
        };
        let group = match self {
            RecvPooled { pool, .. } | ProvideBuffers { pool } | Recycle { pool, .. } => {
                Some(pool.group_id())
            }
            _ => None,
        };
        OpInfo {
            kind: self.kind(),
            fd,
            group,
        }
    }

    /// Stage the operation on `ring`. Kernel facing iovecs and timespecs are boxed into `iov` and
    /// `timespec`, which the caller keeps alongside the operation.
    ///
    /// # Safety
    ///
    /// The operation, `iov` and `timespec` must neither move their heap contents nor be dropped
    /// until the completion for `token` has been acknowledged.
    pub(super) unsafe fn prepare(
        &mut self,
        ring: &mut Ring,
        token: u64,
        iov: &mut Option<Box<IoVec>>,
        timespec: &mut Option<Box<Timespec>>,
    ) -> Result<()> {
        use Operation::*;
        if let RecvPooled { pool, .. } | ProvideBuffers { pool } | Recycle { pool, .. } = self {
            pool.check_ring(ring.id())?;
        }
        let op = match self {
            Nop => Op::nop(),
            Readv { fd, buf, offset } => {
                let iov = iov.insert(Box::new(IoVec::new(buf)));
                Op::readv_raw(*fd, iov.as_ptr(), 1, *offset)
            }
            Writev { fd, buf, offset } => {
                let iov = iov.insert(Box::new(IoVec::new(buf)));
                Op::writev_raw(*fd, iov.as_ptr(), 1, *offset)
            }
            Accept { fd } => Op::accept(*fd),
            Send { fd, buf } => Op::send(*fd, buf),
            Recv { fd, buf } => Op::recv(*fd, buf),
            RecvPooled { fd, pool } => Op::recv_pooled(*fd, &pool.lock()),
            PollAdd { fd, events } => Op::poll_add(*fd, *events),
            ProvideBuffers { pool } => {
                return ring
                    .prepare_provide_buffers(&mut pool.lock(), token)
                    .map(drop)
            }
            Recycle { pool, slot } => {
                return ring
                    .prepare_readd_buffer(&mut pool.lock(), *slot as usize, token)
                    .map(drop)
            }
            Timeout { duration } => {
                let spec = timespec.insert(Box::new(
                    Timespec::new()
                        .sec(duration.as_secs())
                        .nsec(duration.subsec_nanos()),
                ));
                Op::timeout(spec)
            }
        };
        ring.prepare(op, token)
    }

    /// Turn the raw completion of this operation into its [Outcome], handing back owned buffers
    /// and returning pool slots to the application when the kernel rejected them.
    pub(super) fn complete(self, token: Token, result: i32, flags: u32) -> Result<Outcome> {
        use Operation::*;
        let info = self.info();
        // A timer that ran out is the expected result, not a failure.
        let value = match &self {
            Timeout { .. } if result == -libc::ETIME => Ok(0),
            _ => check(result, info),
        };
        if value.is_err() {
            match &self {
                ProvideBuffers { pool } => pool.lock().reclaim(None),
                Recycle { pool, slot } => pool.lock().reclaim(Some(*slot as usize)),
                // The kernel may consume a slot and still fail the receive.
                RecvPooled { pool, .. } if selected_slot(flags).is_some() => {
                    if let Err(err) = pool.lock().select(flags) {
                        warn!(%err, "failed receive reported an unexpected slot");
                    }
                }
                _ => {}
            }
        }
        let value = value?;

        let mut outcome = Outcome::new(token, value, flags);
        match self {
            Readv { buf, .. } | Writev { buf, .. } | Send { buf, .. } | Recv { buf, .. } => {
                outcome.buf = Some(buf);
            }
            Accept { .. } => {
                // SAFETY: A successful accept completes with a fresh descriptor nobody else owns.
                outcome.fd = Some(unsafe { OwnedFd::from_raw_fd(value as RawFd) });
            }
            RecvPooled { pool, .. } => {
                outcome.slot = Some(pool.lock().select(flags)?);
            }
            Nop | PollAdd { .. } | ProvideBuffers { .. } | Recycle { .. } | Timeout { .. } => {}
        }
        Ok(outcome)
    }

    /// The request offering back a slot the kernel consumed for a pooled receive that failed,
    /// the application never learns about such a slot and can't recycle it itself.
    pub(super) fn stray_slot(&self, result: i32, flags: u32) -> Option<Operation> {
        match self {
            Operation::RecvPooled { pool, .. } if result < 0 => {
                selected_slot(flags).map(|slot| Operation::Recycle {
                    pool: pool.clone(),
                    slot,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("info", &self.info())
            .finish()
    }
}
