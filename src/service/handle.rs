use std::{
    fmt,
    future::Future,
    io,
    os::fd::{OwnedFd, RawFd},
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use futures::future::{self, Either};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::{debug, error, warn};

use crate::{buffer::BufferPool, ring::Ring, sync::OneShot, Error, Result};

use super::{
    continuation::Sink,
    waiter::{Command, Waiter, RESERVED_SLOTS},
    Continuation, Operation, Outcome, PoolHandle, Submission,
};

/// Configuration for a [RingService].
pub struct ServiceBuilder {
    depth: u32,
    name: Option<String>,
    stack_size: usize,
}

impl ServiceBuilder {
    /// Create a default service configuration with a ring depth of 256.
    pub fn new() -> ServiceBuilder {
        ServiceBuilder {
            depth: 256,
            name: None,
            stack_size: 0,
        }
    }

    /// Depth of the underlying ring. Two slots are kept for the waiter's own requests, so the
    /// depth has to be at least three.
    pub fn depth(&mut self, depth: u32) -> &mut Self {
        self.depth = depth;
        self
    }

    /// Set the name of the waiter thread.
    pub fn name<S: Into<String>>(&mut self, name: S) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Set the stack size of the waiter thread, in bytes.
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Set up the ring and start the waiter thread.
    pub fn build(&self) -> Result<RingService> {
        if self.depth <= RESERVED_SLOTS {
            return Err(Error::Setup(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("service depth must exceed {}", RESERVED_SLOTS),
            )));
        }
        let ring = Ring::new(self.depth)?;
        let kick = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map(Arc::new)
            .map_err(|errno| Error::Setup(io::Error::from(errno)))?;
        let (tx, rx) = mpsc::channel();

        let mut thread_builder = thread::Builder::new()
            .name(self.name.clone().unwrap_or_else(|| "libring-waiter".into()));
        if self.stack_size > 0 {
            thread_builder = thread_builder.stack_size(self.stack_size);
        }
        let ring_id = ring.id();
        let waiter = Waiter::new(ring, rx, kick.clone());
        let waiter = thread_builder
            .spawn(move || waiter.run())
            .map_err(Error::Setup)?;

        debug!(ring = ring_id, depth = self.depth, "ring service started");
        Ok(RingService {
            tx: Mutex::new(tx),
            kick,
            ring_id,
            waiter: Some(waiter),
            next_group: AtomicU16::new(0),
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("depth", &self.depth)
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// The [RingService] bridges callers on any thread to a single [Ring] driven by a dedicated
/// waiter thread.
///
/// Requests are sent to the waiter, which registers each one in its correlation table before
/// staging it, submits in batches and delivers every completion to the request's [Continuation].
/// Requests that don't fit the ring wait in a backlog until completions free capacity.
///
/// Stopping, explicitly through [RingService::stop] or implicitly on drop, notifies every pending
/// continuation with [Error::ShutdownAbandoned], cancels whatever is still in flight and waits
/// for the kernel to let go of every buffer before the ring is torn down.
pub struct RingService {
    tx: Mutex<mpsc::Sender<Command>>,
    kick: Arc<EventFd>,
    ring_id: u64,
    waiter: Option<JoinHandle<Result<()>>>,
    next_group: AtomicU16,
}

#[allow(dead_code)]
trait AssertSendSync: Send + Sync {}
impl AssertSendSync for RingService {}

impl RingService {
    /// Create a new service with the default configuration.
    pub fn new() -> Result<RingService> {
        ServiceBuilder::new().build()
    }

    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Hand `op` to the waiter, `continuation` is notified exactly once with its result. Requests
    /// made after the service stopped are notified with [Error::ShutdownAbandoned].
    pub fn submit<C>(&self, op: Operation, continuation: C)
    where
        C: Continuation,
    {
        self.command(Command::Submit(op, Sink::new(Box::new(continuation))));
    }

    fn command(&self, command: Command) {
        let sent = self
            .tx
            .lock()
            .expect("failed to lock service sender: poisoned")
            .send(command);
        match sent {
            // Dropping the returned command abandons its continuation.
            Err(_) => debug!("waiter gone, request abandoned"),
            Ok(()) => {
                if let Err(err) = self.kick.write(1) {
                    warn!(%err, "failed to kick waiter");
                }
            }
        }
    }

    fn typed<T, F>(&self, op: Operation, map: F) -> Submission<T>
    where
        F: FnOnce(Outcome) -> Result<T> + Send + 'static,
    {
        let shot = OneShot::new();
        self.submit(op, shot.clone());
        Submission::new(shot, map)
    }

    pub fn nop(&self) -> Submission<()> {
        self.typed(Operation::Nop, |_| Ok(()))
    }

    /// Read up to `buf.len()` bytes from `fd` at `offset`, resolving to the byte count and the
    /// buffer.
    pub fn readv(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Submission<(usize, Vec<u8>)> {
        self.typed(Operation::Readv { fd, buf, offset }, with_buffer)
    }

    /// Write `buf` to `fd` at `offset`, resolving to the byte count and the buffer.
    pub fn writev(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Submission<(usize, Vec<u8>)> {
        self.typed(Operation::Writev { fd, buf, offset }, with_buffer)
    }

    pub fn accept(&self, fd: RawFd) -> Submission<OwnedFd> {
        self.typed(Operation::Accept { fd }, |outcome| {
            outcome.fd.ok_or(Error::Disconnected)
        })
    }

    pub fn send(&self, fd: RawFd, buf: Vec<u8>) -> Submission<(usize, Vec<u8>)> {
        self.typed(Operation::Send { fd, buf }, with_buffer)
    }

    pub fn recv(&self, fd: RawFd, buf: Vec<u8>) -> Submission<(usize, Vec<u8>)> {
        self.typed(Operation::Recv { fd, buf }, with_buffer)
    }

    /// Receive into a slot of `pool` chosen by the kernel, resolving to the slot and the byte
    /// count. The slot belongs to the application until handed back with [RingService::recycle].
    pub fn recv_pooled(&self, fd: RawFd, pool: &PoolHandle) -> Submission<(u16, usize)> {
        let op = Operation::RecvPooled {
            fd,
            pool: pool.clone(),
        };
        self.typed(op, |outcome| match outcome.slot {
            Some(slot) => Ok((slot, outcome.value as usize)),
            None => Err(Error::Disconnected),
        })
    }

    /// One shot readiness poll, resolving to the returned event mask.
    pub fn poll_add(&self, fd: RawFd, events: u32) -> Submission<u32> {
        self.typed(Operation::PollAdd { fd, events }, |outcome| Ok(outcome.value))
    }

    /// Allocate a pool of `slot_count` slots of `slot_size` bytes under a fresh group id and offer
    /// it to the kernel. Resolves once the kernel accepted the pool, only then may pool backed
    /// receives be issued against it.
    ///
    /// The service keeps every registered pool alive until it stops, dropping the returned handle
    /// does not release the pool's memory. The handle is only valid with this service, other
    /// services refuse it with [Error::InvalidPool].
    pub fn create_buffer_pool(
        &self,
        slot_count: usize,
        slot_size: usize,
    ) -> Submission<PoolHandle> {
        let group_id = self.next_group.fetch_add(1, Ordering::Relaxed);
        let pool = match BufferPool::new(slot_count, slot_size, group_id) {
            Ok(pool) => PoolHandle::new(pool, self.ring_id),
            Err(err) => return Submission::failed(err),
        };
        let handle = pool.clone();
        self.typed(Operation::ProvideBuffers { pool }, move |_| Ok(handle))
    }

    /// Zero a slot handed out by [RingService::recv_pooled] and offer it back to the kernel.
    pub fn recycle(&self, pool: &PoolHandle, slot: u16) -> Submission<()> {
        let op = Operation::Recycle {
            pool: pool.clone(),
            slot,
        };
        self.typed(op, |_| Ok(()))
    }

    /// Resolve once `duration` elapsed, timed by the kernel.
    pub fn sleep(&self, duration: Duration) -> Submission<()> {
        self.typed(Operation::Timeout { duration }, |_| Ok(()))
    }

    /// Race `future` against a kernel timer, failing with [Error::TimedOut] if the timer wins.
    /// The losing timer stays armed until it expires or the service stops.
    pub fn timeout<F, T>(&self, duration: Duration, future: F) -> impl Future<Output = Result<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let timer = self.sleep(duration);
        async move {
            futures::pin_mut!(future);
            match future::select(future, timer).await {
                Either::Left((result, _)) => result,
                Either::Right((Ok(()), _)) => Err(Error::TimedOut(duration)),
                Either::Right((Err(err), _)) => Err(err),
            }
        }
    }

    /// Id of the ring driven by this service.
    pub fn ring_id(&self) -> u64 {
        self.ring_id
    }

    /// Stop the waiter and wait for it to tear down the ring, returning the error that ended it
    /// early if any. Calling this more than once is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let waiter = match self.waiter.take() {
            Some(waiter) => waiter,
            None => return Ok(()),
        };
        self.command(Command::Stop);
        match waiter.join() {
            Ok(result) => result,
            Err(_) => {
                error!("ring waiter panicked");
                Err(Error::Disconnected)
            }
        }
    }
}

fn with_buffer(outcome: Outcome) -> Result<(usize, Vec<u8>)> {
    let len = outcome.value as usize;
    outcome
        .buf
        .map(|buf| (len, buf))
        .ok_or(Error::Disconnected)
}

impl fmt::Debug for RingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingService")
            .field("ring_id", &self.ring_id)
            .field("running", &self.waiter.is_some())
            .finish()
    }
}

impl Drop for RingService {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "ring service stopped with error");
        }
    }
}
