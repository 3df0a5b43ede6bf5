use std::{
    fmt,
    io::{IoSlice, IoSliceMut},
    os::fd::RawFd,
    ptr,
};

use io_uring::{
    opcode, squeue,
    types::{self, Timespec},
};
use nix::libc;

use crate::buffer::BufferPool;

/// The kind of operation a request carries, used for diagnostics and error translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Nop,
    Readv,
    Writev,
    Accept,
    Send,
    Recv,
    PollAdd,
    ProvideBuffers,
    Timeout,
    Cancel,
    EpollCtl,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OpKind::*;
        let name = match self {
            Nop => "nop",
            Readv => "readv",
            Writev => "writev",
            Accept => "accept",
            Send => "send",
            Recv => "recv",
            PollAdd => "poll_add",
            ProvideBuffers => "provide_buffers",
            Timeout => "timeout",
            Cancel => "cancel",
            EpollCtl => "epoll_ctl",
        };
        f.write_str(name)
    }
}

/// Diagnostic metadata of an [Op], kept by callers so that a completion can be translated into a
/// meaningful error after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub kind: OpKind,
    pub fd: Option<RawFd>,
    /// The buffer group for pool backed operations.
    pub group: Option<u16>,
}

/// A single operation ready to be staged with [super::Ring::prepare].
///
/// Constructing an [Op] is always safe, it merely records raw pointers to the buffers involved.
/// Staging it is where the caller promises those buffers stay alive until the completion is
/// acknowledged.
pub struct Op {
    info: OpInfo,
    entry: squeue::Entry,
}

impl Op {
    fn new(kind: OpKind, fd: Option<RawFd>, entry: squeue::Entry) -> Op {
        Op {
            info: OpInfo {
                kind,
                fd,
                group: None,
            },
            entry,
        }
    }

    /// An operation that does nothing but produce a completion.
    pub fn nop() -> Op {
        Op::new(OpKind::Nop, None, opcode::Nop::new().build())
    }

    /// Vectored read from `fd` at `offset` into the given slices.
    pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>], offset: u64) -> Op {
        // IoSliceMut is guaranteed to be ABI compatible with iovec on unix targets.
        Op::readv_raw(fd, bufs.as_ptr().cast(), bufs.len() as u32, offset)
    }

    pub(crate) fn readv_raw(fd: RawFd, iov: *const libc::iovec, len: u32, offset: u64) -> Op {
        let entry = opcode::Readv::new(types::Fd(fd), iov, len)
            .offset(offset)
            .build();
        Op::new(OpKind::Readv, Some(fd), entry)
    }

    /// Vectored write of the given slices to `fd` at `offset`.
    pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>], offset: u64) -> Op {
        Op::writev_raw(fd, bufs.as_ptr().cast(), bufs.len() as u32, offset)
    }

    pub(crate) fn writev_raw(fd: RawFd, iov: *const libc::iovec, len: u32, offset: u64) -> Op {
        let entry = opcode::Writev::new(types::Fd(fd), iov, len)
            .offset(offset)
            .build();
        Op::new(OpKind::Writev, Some(fd), entry)
    }

    /// Accept a single connection on the listening socket `fd`, the accepted descriptor is the
    /// completion's result.
    pub fn accept(fd: RawFd) -> Op {
        Op::accept_with_addr(fd, ptr::null_mut(), ptr::null_mut())
    }

    /// Like [Op::accept], with the kernel also writing the peer address to `addr` and its length
    /// to `addrlen`. `addrlen` has to hold the size of the `addr` buffer when staged, and both must
    /// stay valid until the completion is acknowledged.
    pub fn accept_with_addr(
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    ) -> Op {
        let entry = opcode::Accept::new(types::Fd(fd), addr, addrlen)
            .flags(libc::SOCK_CLOEXEC)
            .build();
        Op::new(OpKind::Accept, Some(fd), entry)
    }

    pub fn send(fd: RawFd, buf: &[u8]) -> Op {
        let entry = opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32).build();
        Op::new(OpKind::Send, Some(fd), entry)
    }

    pub fn recv(fd: RawFd, buf: &mut [u8]) -> Op {
        let entry = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32).build();
        Op::new(OpKind::Recv, Some(fd), entry)
    }

    /// Receive into a slot of `pool` chosen by the kernel, see [crate::buffer::selected_slot] for
    /// recovering the slot from the completion.
    pub fn recv_pooled(fd: RawFd, pool: &BufferPool) -> Op {
        let entry = opcode::Recv::new(types::Fd(fd), ptr::null_mut(), pool.slot_size() as u32)
            .buf_group(pool.group_id())
            .build()
            .flags(squeue::Flags::BUFFER_SELECT);
        let mut op = Op::new(OpKind::Recv, Some(fd), entry);
        op.info.group = Some(pool.group_id());
        op
    }

    /// One shot readiness poll of `fd` for the given `poll(2)` event mask.
    pub fn poll_add(fd: RawFd, events: u32) -> Op {
        let entry = opcode::PollAdd::new(types::Fd(fd), events).build();
        Op::new(OpKind::PollAdd, Some(fd), entry)
    }

    /// Kernel timer that completes with `-ETIME` once `timespec` elapsed.
    pub fn timeout(timespec: &Timespec) -> Op {
        let entry = opcode::Timeout::new(timespec as *const _).build();
        Op::new(OpKind::Timeout, None, entry)
    }

    /// Best effort cancellation of the in flight operation carrying `token`.
    pub fn cancel(token: u64) -> Op {
        let entry = opcode::AsyncCancel::new(token).build();
        Op::new(OpKind::Cancel, None, entry)
    }

    /// Change the registration of `fd` on the epoll instance `epfd` the way `epoll_ctl(2)` does
    /// for `op`. `event` must stay valid until the completion is acknowledged.
    pub fn epoll_ctl(epfd: RawFd, fd: RawFd, op: i32, event: &libc::epoll_event) -> Op {
        let event = event as *const libc::epoll_event as *const types::epoll_event;
        let entry = opcode::EpollCtl::new(types::Fd(epfd), types::Fd(fd), op, event).build();
        Op::new(OpKind::EpollCtl, Some(fd), entry)
    }

    pub(crate) fn provide_buffers(
        addr: *mut u8,
        slot_size: usize,
        slots: u16,
        group: u16,
        first_slot: u16,
    ) -> Op {
        let entry =
            opcode::ProvideBuffers::new(addr, slot_size as i32, slots, group, first_slot).build();
        let mut op = Op::new(OpKind::ProvideBuffers, None, entry);
        op.info.group = Some(group);
        op
    }

    pub fn info(&self) -> OpInfo {
        self.info
    }

    pub fn kind(&self) -> OpKind {
        self.info.kind
    }

    pub(crate) fn into_entry(self, token: u64) -> squeue::Entry {
        self.entry.user_data(token)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op").field("info", &self.info).finish()
    }
}
