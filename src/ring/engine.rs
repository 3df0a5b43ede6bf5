use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use io_uring::{
    types::{SubmitArgs, Timespec},
    IoUring,
};
use nix::libc;
use tracing::{debug, error, trace};

use crate::{buffer::BufferPool, Error, Result};

use super::{Completion, Features, Op, OpInfo};

// io_uring_enter(2) flag asking the kernel to wait for completions.
const IORING_ENTER_GETEVENTS: u32 = 1;

static NEXT_RING_ID: AtomicU64 = AtomicU64::new(0);

/// Configuration for a [Ring], modelled after the io_uring setup flags.
#[derive(Debug, Clone)]
pub struct RingBuilder {
    depth: u32,
    sqpoll_idle: Option<u32>,
    iopoll: bool,
    cq_size: Option<u32>,
}

impl RingBuilder {
    /// Create a default ring configuration with a depth of 64 entries.
    pub fn new() -> Self {
        Self {
            depth: 64,
            sqpoll_idle: None,
            iopoll: false,
            cq_size: None,
        }
    }

    /// Maximum number of operations that can be prepared or in flight at once.
    pub fn depth(&mut self, depth: u32) -> &mut Self {
        self.depth = depth;
        self
    }

    /// Let a kernel thread poll the submission queue, going idle after `idle_ms` milliseconds
    /// without work.
    pub fn sqpoll(&mut self, idle_ms: u32) -> &mut Self {
        self.sqpoll_idle = Some(idle_ms);
        self
    }

    /// Busy poll for completions, only valid for files opened with `O_DIRECT`.
    pub fn iopoll(&mut self) -> &mut Self {
        self.iopoll = true;
        self
    }

    /// Override the completion queue size, which defaults to twice the depth.
    pub fn cq_size(&mut self, entries: u32) -> &mut Self {
        self.cq_size = Some(entries);
        self
    }

    /// Set up the kernel ring with the given configuration.
    pub fn build(&self) -> Result<Ring> {
        if self.depth == 0 {
            return Err(Error::Setup(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue depth must be non zero",
            )));
        }

        let mut builder = IoUring::builder();
        if let Some(idle) = self.sqpoll_idle {
            builder.setup_sqpoll(idle);
        }
        if self.iopoll {
            builder.setup_iopoll();
        }
        if let Some(entries) = self.cq_size {
            builder.setup_cqsize(entries);
        }
        let uring = builder.build(self.depth).map_err(Error::Setup)?;
        let features = Features::from(uring.params());
        let id = NEXT_RING_ID.fetch_add(1, Ordering::Relaxed);

        debug!(ring = id, depth = self.depth, ?features, "io_uring ready");
        Ok(Ring {
            id,
            uring,
            depth: self.depth,
            prepared: 0,
            submitted: 0,
            features,
        })
    }
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The [Ring] is the queue engine proper. It owns the kernel submission and completion rings and
/// keeps exact accounting of where every operation is in its lifecycle:
///
/// `prepared() + submitted() + capacity() == depth()`
///
/// Operations are staged with [Ring::prepare], handed to the kernel with [Ring::submit] and come
/// back in any order through [Ring::wait] or [Ring::peek]. A completion only stops counting as
/// submitted once it has been passed to [Ring::acknowledge].
///
/// The ring takes `&mut self` everywhere and does no locking, confine it to a single thread or
/// wrap it as [crate::context] does.
pub struct Ring {
    id: u64,
    uring: IoUring,
    depth: u32,
    prepared: u32,
    submitted: u32,
    features: Features,
}

impl Ring {
    /// Create a new [Ring] with the specified depth and default settings.
    pub fn new(depth: u32) -> Result<Ring> {
        RingBuilder::new().depth(depth).build()
    }

    pub fn builder() -> RingBuilder {
        RingBuilder::new()
    }

    /// Process wide unique identifier of this ring, used to tag its log records.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of operations that can still be prepared.
    pub fn capacity(&self) -> u32 {
        self.depth - self.prepared - self.submitted
    }

    /// Number of operations staged but not yet consumed by the kernel.
    pub fn prepared_count(&self) -> u32 {
        self.prepared
    }

    /// Number of operations consumed by the kernel whose completions are not yet acknowledged.
    pub fn submitted_count(&self) -> u32 {
        self.submitted
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Stage an operation, tagging it with `token` which is returned untouched on its completion.
    /// Fails with [Error::QueueFull] when no capacity is left, in which case nothing was staged.
    ///
    /// # Safety
    ///
    /// Every buffer, iovec array and timespec referenced by `op` must stay valid, and must not be
    /// touched by anything else, until the matching [Completion] has been acknowledged.
    pub unsafe fn prepare(&mut self, op: Op, token: u64) -> Result<()> {
        self.reserve()?;
        self.push(op, token)
    }

    /// Stage the registration of a whole [BufferPool] with the kernel, all of its slots become
    /// offered. The pool must not be used for pool backed operations before this completed.
    ///
    /// # Safety
    ///
    /// `pool` must outlive the ring, or at least every offered slot must be consumed or the ring
    /// torn down, before the pool is dropped.
    pub unsafe fn prepare_provide_buffers(
        &mut self,
        pool: &mut BufferPool,
        token: u64,
    ) -> Result<OpInfo> {
        self.reserve()?;
        let addr = pool.offer_all()?;
        let op = Op::provide_buffers(
            addr,
            pool.slot_size(),
            pool.slot_count() as u16,
            pool.group_id(),
            0,
        );
        let info = op.info();
        if let Err(err) = self.push(op, token) {
            pool.reclaim(None);
            return Err(err);
        }
        Ok(info)
    }

    /// Clear a single slot the application is done with and offer it back to the kernel.
    ///
    /// # Safety
    ///
    /// Same contract as [Ring::prepare_provide_buffers].
    pub unsafe fn prepare_readd_buffer(
        &mut self,
        pool: &mut BufferPool,
        index: usize,
        token: u64,
    ) -> Result<OpInfo> {
        self.reserve()?;
        let addr = pool.reoffer(index)?;
        let op = Op::provide_buffers(addr, pool.slot_size(), 1, pool.group_id(), index as u16);
        let info = op.info();
        if let Err(err) = self.push(op, token) {
            pool.reclaim(Some(index));
            return Err(err);
        }
        Ok(info)
    }

    fn reserve(&self) -> Result<()> {
        if self.capacity() == 0 {
            return Err(Error::QueueFull);
        }
        Ok(())
    }

    unsafe fn push(&mut self, op: Op, token: u64) -> Result<()> {
        let kind = op.kind();
        let entry = op.into_entry(token);
        if self.uring.submission().push(&entry).is_err() {
            return Err(Error::QueueFull);
        }
        self.prepared += 1;
        trace!(ring = self.id, token, %kind, "prepared operation");
        Ok(())
    }

    /// Hand every prepared operation to the kernel, returning how many it consumed.
    ///
    /// A failure here is fatal for the batch, however anything submitted before remains in flight
    /// and still has to be waited for.
    pub fn submit(&mut self) -> Result<usize> {
        let result = self.uring.submit();
        let consumed = self.sync_submitted();
        match result {
            Ok(_) => {
                if consumed > 0 {
                    trace!(ring = self.id, consumed, "submitted operations");
                }
                Ok(consumed as usize)
            }
            Err(err) => {
                error!(ring = self.id, consumed, %err, "submit failed");
                Err(Error::SubmitFailed(err))
            }
        }
    }

    // Move whatever the kernel consumed from the submission queue over to the in flight count.
    fn sync_submitted(&mut self) -> u32 {
        let remaining = self.uring.submission().len() as u32;
        let consumed = self.prepared.saturating_sub(remaining);
        self.prepared = remaining;
        self.submitted += consumed;
        consumed
    }

    fn pop(&mut self) -> Option<Completion> {
        self.uring
            .completion()
            .next()
            .map(|entry| Completion::new(self.id, entry))
    }

    /// Block until a completion is available. This never submits, prepared operations stay
    /// prepared. Interrupted waits are retried, waiting on a ring with nothing in flight is an
    /// error as it could never return.
    pub fn wait(&mut self) -> Result<Completion> {
        loop {
            self.sync_submitted();
            if let Some(completion) = self.pop() {
                return Ok(completion);
            }
            if self.submitted == 0 {
                return Err(Error::Wait(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "no operations in flight",
                )));
            }

            // SAFETY: No argument is passed and nothing is submitted, this is a plain wait for a
            // single completion.
            let result = unsafe {
                self.uring
                    .submitter()
                    .enter::<libc::sigset_t>(0, 1, IORING_ENTER_GETEVENTS, None)
            };
            match result {
                Ok(_) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {
                    debug!(ring = self.id, "wait interrupted, retrying");
                }
                Err(err) => return Err(Error::Wait(err)),
            }
        }
    }

    /// Return a completion if one is ready, without blocking.
    pub fn peek(&mut self) -> Option<Completion> {
        self.sync_submitted();
        self.pop()
    }

    /// Submit anything prepared and wait up to `timeout` for a completion. The timeout is armed in
    /// the kernel alongside the wait, so an expired wait simply yields `None`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<Completion>> {
        if let Some(completion) = self.peek() {
            return Ok(Some(completion));
        }

        let spec = Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = SubmitArgs::new().timespec(&spec);
        let result = self.uring.submitter().submit_with_args(1, &args);
        self.sync_submitted();
        match result {
            Ok(_) => {}
            Err(err) => match err.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => {}
                Some(libc::EBUSY) => {}
                _ => return Err(Error::Wait(err)),
            },
        }
        Ok(self.pop())
    }

    /// Mark a completion as seen, releasing its slot in the ring's accounting.
    pub fn acknowledge(&mut self, completion: Completion) {
        debug_assert_eq!(
            completion.ring_id(),
            self.id,
            "completion acknowledged on a foreign ring"
        );
        trace!(ring = self.id, token = completion.token(), "acknowledged");
        completion.disarm();
        self.submitted = self.submitted.saturating_sub(1);
    }

    /// Submit anything prepared, then wait for and acknowledge every outstanding completion. The
    /// completions are discarded, returns how many there were.
    pub fn drain(&mut self) -> Result<usize> {
        self.submit()?;
        let mut drained = 0;
        while self.submitted > 0 {
            let completion = self.wait()?;
            self.acknowledge(completion);
            drained += 1;
        }
        debug!(ring = self.id, drained, "drained ring");
        Ok(drained)
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("prepared", &self.prepared)
            .field("submitted", &self.submitted)
            .finish()
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if self.submitted > 0 {
            // The kernel may still write into buffers the caller is about to free.
            error!(
                ring = self.id,
                in_flight = self.submitted,
                "ring dropped with operations in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{IoSlice, IoSliceMut, Write},
        mem,
        net::{TcpListener, TcpStream},
        os::{
            fd::{AsRawFd, FromRawFd, OwnedFd},
            unix::net::UnixStream,
        },
    };

    use super::*;
    use crate::{
        buffer::SlotState,
        ring::OpKind,
        test_util::{file_with, ring},
    };

    const CONTENTS: &[u8] = b"the quick brown fox jumps over the lazy dog\n";

    #[test]
    fn test_rejects_zero_depth() {
        assert!(matches!(Ring::new(0), Err(Error::Setup(_))));
    }

    #[test]
    fn test_rejects_huge_depth() {
        if ring(1).is_none() {
            return;
        }
        assert!(matches!(Ring::new(u32::MAX), Err(Error::Setup(_))));
    }

    #[test]
    fn test_submit_empty_queue() {
        let Some(mut ring) = ring(1) else { return };
        assert_eq!(ring.submit().unwrap(), 0);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn test_wait_with_nothing_in_flight_fails() {
        let Some(mut ring) = ring(1) else { return };
        assert!(matches!(ring.wait(), Err(Error::Wait(_))));
    }

    #[test]
    fn test_capacity_accounting() {
        let Some(mut ring) = ring(4) else { return };
        assert_eq!(ring.capacity(), 4);

        for token in 0..4 {
            unsafe { ring.prepare(Op::nop(), token).unwrap() };
        }
        assert_eq!(ring.capacity(), 0);
        assert_eq!(ring.prepared_count(), 4);
        assert!(matches!(
            unsafe { ring.prepare(Op::nop(), 99) },
            Err(Error::QueueFull)
        ));

        assert_eq!(ring.submit().unwrap(), 4);
        assert_eq!(ring.prepared_count(), 0);
        assert_eq!(ring.submitted_count(), 4);
        assert_eq!(ring.capacity(), 0);

        let completion = ring.wait().unwrap();
        ring.acknowledge(completion);
        assert_eq!(ring.submitted_count(), 3);
        assert_eq!(ring.capacity(), 1);

        assert_eq!(ring.drain().unwrap(), 3);
        assert_eq!(ring.capacity(), 4);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn test_nop_round_trips_token() {
        let Some(mut ring) = ring(2) else { return };
        unsafe { ring.prepare(Op::nop(), 10).unwrap() };
        ring.submit().unwrap();

        let completion = ring.wait().unwrap();
        assert_eq!(completion.token(), 10);
        assert_eq!(completion.result(), 0);
        ring.acknowledge(completion);
    }

    #[test]
    fn test_depth_one_readv_scenario() {
        let Some(mut ring) = ring(1) else { return };
        let file = file_with(CONTENTS);
        let fd = file.as_file().as_raw_fd();

        let mut first = vec![0u8; 1024];
        let mut second = vec![0u8; 1024];
        let mut bufs = [IoSliceMut::new(&mut first)];
        let mut other = [IoSliceMut::new(&mut second)];

        unsafe { ring.prepare(Op::readv(fd, &mut bufs, 0), 1).unwrap() };
        assert!(matches!(
            unsafe { ring.prepare(Op::readv(fd, &mut other, 0), 2) },
            Err(Error::QueueFull)
        ));

        ring.submit().unwrap();
        let completion = ring.wait().unwrap();
        assert_eq!(completion.token(), 1);
        ring.acknowledge(completion);
        assert_eq!(ring.capacity(), 1);
    }

    #[test]
    fn test_readv_reads_whole_file() {
        let Some(mut ring) = ring(1) else { return };
        let file = file_with(CONTENTS);
        let fd = file.as_file().as_raw_fd();
        let mut buf = vec![b'!'; CONTENTS.len()];

        {
            let mut bufs = [IoSliceMut::new(&mut buf)];
            let op = Op::readv(fd, &mut bufs, 0);
            let info = op.info();
            unsafe { ring.prepare(op, 0).unwrap() };
            ring.submit().unwrap();

            let completion = ring.wait().unwrap();
            assert_eq!(completion.value(info).unwrap() as usize, CONTENTS.len());
            assert_eq!(completion.flags(), 0);
            ring.acknowledge(completion);
        }
        assert_eq!(buf, CONTENTS);
    }

    #[test]
    fn test_peek_after_acknowledge_is_empty() {
        let Some(mut ring) = ring(1) else { return };
        let file = file_with(CONTENTS);
        let fd = file.as_file().as_raw_fd();
        let mut buf = vec![0u8; CONTENTS.len()];
        let mut bufs = [IoSliceMut::new(&mut buf)];

        unsafe { ring.prepare(Op::readv(fd, &mut bufs, 0), 0).unwrap() };
        ring.submit().unwrap();
        let completion = ring.wait().unwrap();
        ring.acknowledge(completion);
        assert_eq!(ring.submitted_count(), 0);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn test_writev_then_readv() {
        let Some(mut ring) = ring(2) else { return };
        let file = file_with(b"");
        let fd = file.as_file().as_raw_fd();

        let bufs = [IoSlice::new(b"hello "), IoSlice::new(b"world")];
        let op = Op::writev(fd, &bufs, 0);
        let info = op.info();
        unsafe { ring.prepare(op, 1).unwrap() };
        ring.submit().unwrap();
        let completion = ring.wait().unwrap();
        assert_eq!(completion.value(info).unwrap(), 11);
        ring.acknowledge(completion);

        let mut out = vec![0u8; 11];
        {
            let mut bufs = [IoSliceMut::new(&mut out)];
            unsafe { ring.prepare(Op::readv(fd, &mut bufs, 0), 2).unwrap() };
            ring.submit().unwrap();
            let completion = ring.wait().unwrap();
            ring.acknowledge(completion);
        }
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_failed_operation_translates_error() {
        let Some(mut ring) = ring(1) else { return };
        let mut buf = vec![0u8; 8];
        let mut bufs = [IoSliceMut::new(&mut buf)];
        let op = Op::readv(-1, &mut bufs, 0);
        let info = op.info();

        unsafe { ring.prepare(op, 5).unwrap() };
        ring.submit().unwrap();
        let completion = ring.wait().unwrap();
        assert!(completion.result() < 0);
        match completion.value(info) {
            Err(Error::OperationFailed { kind, fd, source }) => {
                assert_eq!(kind, OpKind::Readv);
                assert_eq!(fd, Some(-1));
                assert_eq!(source.raw_os_error(), Some(libc::EBADF));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        ring.acknowledge(completion);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let Some(mut ring) = ring(2) else { return };
        let spec = Timespec::new().sec(5);
        unsafe { ring.prepare(Op::timeout(&spec), 1).unwrap() };

        let completion = ring.wait_timeout(Duration::from_millis(20)).unwrap();
        assert!(completion.is_none());
        assert_eq!(ring.submitted_count(), 1);

        unsafe { ring.prepare(Op::cancel(1), 2).unwrap() };
        assert_eq!(ring.drain().unwrap(), 2);
    }

    #[test]
    fn test_timeout_and_cancel_drain() {
        let Some(mut ring) = ring(2) else { return };
        let spec = Timespec::new().sec(30);
        unsafe { ring.prepare(Op::timeout(&spec), 1).unwrap() };
        unsafe { ring.prepare(Op::cancel(1), 2).unwrap() };
        assert_eq!(ring.drain().unwrap(), 2);
        assert_eq!(ring.capacity(), 2);
    }

    #[test]
    fn test_provide_buffers_marks_pool_offered() {
        let Some(mut ring) = ring(2) else { return };
        let mut pool = BufferPool::new(4, 32, 1).unwrap();

        let info = unsafe { ring.prepare_provide_buffers(&mut pool, 1).unwrap() };
        assert_eq!(info.kind, OpKind::ProvideBuffers);
        assert_eq!(pool.offered_count(), 4);
        ring.submit().unwrap();

        let completion = ring.wait().unwrap();
        completion.value(info).unwrap();
        ring.acknowledge(completion);
    }

    #[test]
    fn test_readd_requires_owned_slot() {
        let Some(mut ring) = ring(2) else { return };
        let mut pool = BufferPool::new(2, 16, 0).unwrap();
        unsafe { ring.prepare_provide_buffers(&mut pool, 1).unwrap() };
        assert!(matches!(
            unsafe { ring.prepare_readd_buffer(&mut pool, 0, 2) },
            Err(Error::SlotOffered { index: 0 })
        ));
        assert!(matches!(
            unsafe { ring.prepare_readd_buffer(&mut pool, 5, 2) },
            Err(Error::InvalidSlot { index: 5, .. })
        ));
        // Failed prepares don't consume capacity.
        assert_eq!(ring.prepared_count(), 1);
        ring.drain().unwrap();
        assert_eq!(pool.state(0).unwrap(), SlotState::Offered);
    }

    #[test]
    fn test_provide_on_full_queue_leaves_pool_idle() {
        let Some(mut ring) = ring(1) else { return };
        let mut pool = BufferPool::new(2, 16, 0).unwrap();
        unsafe { ring.prepare(Op::nop(), 0).unwrap() };
        assert!(matches!(
            unsafe { ring.prepare_provide_buffers(&mut pool, 1) },
            Err(Error::QueueFull)
        ));
        assert_eq!(pool.offered_count(), 0);
        ring.drain().unwrap();
    }

    #[test]
    fn test_accept_reports_peer_address() {
        let Some(mut ring) = ring(2) else { return };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let op = Op::accept_with_addr(
            listener.as_raw_fd(),
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        unsafe { ring.prepare(op, 1).unwrap() };
        ring.submit().unwrap();

        let completion = ring.wait().unwrap();
        let fd = completion.result();
        ring.acknowledge(completion);
        assert!(fd >= 0, "accept failed: {}", fd);
        let _conn = unsafe { OwnedFd::from_raw_fd(fd) };

        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(addr.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(
            u16::from_be(addr.sin_port),
            client.local_addr().unwrap().port()
        );
    }

    #[test]
    fn test_epoll_ctl_registers_descriptor() {
        let Some(mut ring) = ring(2) else { return };
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epfd >= 0);
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };
        let (ours, mut theirs) = UnixStream::pair().unwrap();

        let event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 7,
        };
        let add = |ring: &mut Ring, token| {
            let op = Op::epoll_ctl(
                epoll.as_raw_fd(),
                ours.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                &event,
            );
            unsafe { ring.prepare(op, token).unwrap() };
            ring.submit().unwrap();
            let completion = ring.wait().unwrap();
            let result = completion.result();
            ring.acknowledge(completion);
            result
        };
        assert_eq!(add(&mut ring, 1), 0);
        // The descriptor is now known to the epoll instance.
        assert_eq!(add(&mut ring, 2), -libc::EEXIST);

        theirs.write_all(b"x").unwrap();
        let mut ready: [libc::epoll_event; 1] = unsafe { mem::zeroed() };
        let count = unsafe { libc::epoll_wait(epoll.as_raw_fd(), ready.as_mut_ptr(), 1, 1000) };
        assert_eq!(count, 1);
        let data = ready[0].u64;
        assert_eq!(data, 7);
    }

    #[test]
    fn test_features_snapshot() {
        let Some(ring) = ring(1) else { return };
        // Any kernel recent enough for the opcodes used here maps both rings at once.
        assert!(ring.features().single_mmap);
    }
}
