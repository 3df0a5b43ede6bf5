use std::{
    collections::VecDeque,
    os::fd::{AsFd, AsRawFd, RawFd},
    sync::{mpsc, Arc},
};

use io_uring::types::Timespec;
use nix::{libc, sys::eventfd::EventFd};
use tracing::{debug, error, trace, warn};

use crate::{
    correlation::{CorrelationTable, Token},
    ptr::IoVec,
    ring::{Completion, Op, Ring},
    Error, Result,
};

use super::{continuation::Sink, Operation, PoolHandle};

/// Ring slots user requests may never take: one for the kick poll and one for the stop sentinel
/// and cancellations.
pub(super) const RESERVED_SLOTS: u32 = 2;

// Tags cancellations issued while tearing down after a failure, never registered in the table.
const ABORT_TOKEN: u64 = u64::MAX;

pub(super) enum Command {
    Submit(Operation, Sink),
    Stop,
}

enum Task {
    User(Operation),
    /// Readiness poll on the kick eventfd.
    Kick(RawFd),
    /// The no-op whose completion starts the shutdown sequence.
    Stop,
    Cancel(Token),
}

/// A request on its way through the waiter, registered in the correlation table from just
/// before it is prepared until its completion has been delivered.
struct Pending {
    task: Task,
    iov: Option<Box<IoVec>>,
    timespec: Option<Box<Timespec>>,
    sink: Sink,
}

impl Pending {
    fn new(task: Task, sink: Sink) -> Pending {
        Pending {
            task,
            iov: None,
            timespec: None,
            sink,
        }
    }

    /// # Safety
    ///
    /// `self` must stay registered, and so alive, until the completion for `token` has been
    /// acknowledged.
    unsafe fn prepare(&mut self, ring: &mut Ring, token: Token) -> Result<()> {
        let raw = token.as_u64();
        match &mut self.task {
            Task::User(op) => op.prepare(ring, raw, &mut self.iov, &mut self.timespec),
            Task::Kick(fd) => ring.prepare(Op::poll_add(*fd, libc::POLLIN as u32), raw),
            Task::Stop => ring.prepare(Op::nop(), raw),
            Task::Cancel(target) => ring.prepare(Op::cancel(target.as_u64()), raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    /// The stop sentinel has been queued but not yet completed.
    StopRequested,
    /// Every continuation has been abandoned, waiting for the kernel to let go of the buffers.
    Stopping,
}

/// The waiter owns the [Ring] and every in flight request. It runs on its own thread, taking
/// commands from the service handles and delivering completions to their continuations.
pub(super) struct Waiter {
    // Dropped first, nothing may still reference the buffers owned below once the ring is gone.
    ring: Ring,
    table: CorrelationTable<Pending>,
    backlog: VecDeque<Pending>,
    control: VecDeque<Pending>,
    pools: Vec<PoolHandle>,
    rx: mpsc::Receiver<Command>,
    kick: Arc<EventFd>,
    kick_armed: bool,
    state: State,
}

impl Waiter {
    pub(super) fn new(ring: Ring, rx: mpsc::Receiver<Command>, kick: Arc<EventFd>) -> Waiter {
        let depth = ring.depth() as usize;
        Waiter {
            ring,
            table: CorrelationTable::with_capacity(depth),
            backlog: VecDeque::new(),
            control: VecDeque::new(),
            pools: Vec::new(),
            rx,
            kick,
            kick_armed: false,
            state: State::Running,
        }
    }

    /// Run until stopped, or until the ring fails in a way that leaves the request accounting in
    /// doubt. Every continuation is notified exactly once in either case.
    pub(super) fn run(mut self) -> Result<()> {
        debug!(ring = self.ring.id(), "waiter started");
        let result = self.serve();
        if let Err(ref err) = result {
            error!(ring = self.ring.id(), %err, "waiter failed, abandoning requests");
            self.abort();
        }
        self.close();
        debug!(ring = self.ring.id(), "waiter stopped");
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            self.arm_kick()?;
            self.accept_commands();
            self.flush()?;
            self.ring.submit()?;
            if self.finished() {
                return Ok(());
            }

            let completion = self.ring.wait()?;
            self.dispatch(completion)?;
            while let Some(completion) = self.ring.peek() {
                self.dispatch(completion)?;
            }
        }
    }

    fn finished(&self) -> bool {
        self.state == State::Stopping
            && self.table.is_empty()
            && self.backlog.is_empty()
            && self.control.is_empty()
    }

    fn arm_kick(&mut self) -> Result<()> {
        if self.kick_armed || self.state == State::Stopping {
            return Ok(());
        }
        if self.ring.capacity() == 0 {
            warn!(ring = self.ring.id(), "no capacity left to arm the kick poll");
            return Ok(());
        }
        let fd = self.kick.as_fd().as_raw_fd();
        self.stage(Pending::new(Task::Kick(fd), Sink::none()))?;
        self.kick_armed = true;
        Ok(())
    }

    fn accept_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match (command, self.state) {
                (Command::Submit(op, sink), State::Running) => {
                    self.backlog.push_back(Pending::new(Task::User(op), sink));
                }
                (Command::Submit(op, mut sink), _) => {
                    debug!(kind = %op.kind(), "request submitted after stop");
                    sink.notify(Err(Error::ShutdownAbandoned));
                }
                (Command::Stop, State::Running) => {
                    debug!(ring = self.ring.id(), "stop requested");
                    self.state = State::StopRequested;
                    self.control.push_back(Pending::new(Task::Stop, Sink::none()));
                }
                (Command::Stop, _) => {}
            }
        }
    }

    // Control requests go first and may use the reserved slots, user requests leave them free.
    fn flush(&mut self) -> Result<()> {
        while self.ring.capacity() > 0 {
            match self.control.pop_front() {
                Some(pending) => self.stage(pending)?,
                None => break,
            }
        }
        let reserved = if self.kick_armed {
            RESERVED_SLOTS - 1
        } else {
            RESERVED_SLOTS
        };
        while self.ring.capacity() > reserved {
            match self.backlog.pop_front() {
                Some(pending) => self.stage(pending)?,
                None => break,
            }
        }
        if !self.backlog.is_empty() {
            trace!(backlog = self.backlog.len(), "requests waiting for capacity");
        }
        Ok(())
    }

    /// Register a request and prepare it under its new token. A request the ring refuses is
    /// deregistered again and its continuation notified, failures of the waiter's own requests are
    /// fatal.
    fn stage(&mut self, pending: Pending) -> Result<()> {
        let token = self.table.register(pending);
        let pending = self.table.resolve(token)?;
        // SAFETY: The request is owned by the table until its completion has been dispatched, and
        // the ring is dropped before the table.
        let prepared = unsafe { pending.prepare(&mut self.ring, token) };
        if let Err(err) = prepared {
            let mut pending = self.table.remove(token)?;
            if !matches!(pending.task, Task::User(_)) {
                return Err(err);
            }
            debug!(%token, %err, "request refused by ring");
            pending.sink.notify(Err(err));
        }
        Ok(())
    }

    fn dispatch(&mut self, completion: Completion) -> Result<()> {
        let token = Token::from_raw(completion.token());
        let (result, flags) = (completion.result(), completion.flags());
        let pending = match self.table.remove(token) {
            Ok(pending) => pending,
            Err(err) => {
                self.ring.acknowledge(completion);
                return Err(err);
            }
        };
        trace!(%token, result, "dispatching completion");

        let Pending { task, mut sink, .. } = pending;
        match task {
            Task::User(op) => {
                let registered = match &op {
                    Operation::ProvideBuffers { pool } => Some(pool.clone()),
                    _ => None,
                };
                let stray = op.stray_slot(result, flags);
                let outcome = op.complete(token, result, flags);
                if let (Some(pool), Ok(_)) = (registered, &outcome) {
                    debug!(group = pool.group_id(), "buffer pool registered");
                    self.pools.push(pool);
                }
                sink.notify(outcome);
                if let (Some(recycle), State::Running) = (stray, self.state) {
                    debug!(%token, "offering back slot of failed receive");
                    self.backlog
                        .push_back(Pending::new(Task::User(recycle), Sink::none()));
                }
            }
            Task::Kick(_) => {
                self.kick_armed = false;
                // Nonblocking, a spurious wake up simply finds the counter at zero.
                if let Err(err) = self.kick.read() {
                    trace!(%err, "kick counter already reset");
                }
            }
            Task::Stop => self.begin_stopping(),
            Task::Cancel(target) => {
                trace!(%token, %target, result, "cancellation finished");
            }
        }
        self.ring.acknowledge(completion);
        Ok(())
    }

    fn begin_stopping(&mut self) {
        self.state = State::Stopping;
        let backlogged = self.backlog.len();
        for mut pending in self.backlog.drain(..) {
            pending.sink.notify(Err(Error::ShutdownAbandoned));
        }

        let mut targets = Vec::new();
        for (token, pending) in self.table.iter_mut() {
            match pending.task {
                Task::User(_) | Task::Kick(_) => targets.push(token),
                Task::Stop | Task::Cancel(_) => continue,
            }
            pending.sink.notify(Err(Error::ShutdownAbandoned));
        }
        debug!(
            ring = self.ring.id(),
            backlogged,
            in_flight = targets.len(),
            "stopping, cancelling in flight requests"
        );
        for target in targets {
            self.control
                .push_back(Pending::new(Task::Cancel(target), Sink::none()));
        }
    }

    // Best effort cleanup after a fatal error. Whatever the kernel may still write into is leaked
    // rather than freed underneath it.
    fn abort(&mut self) {
        for mut pending in self.backlog.drain(..).chain(self.control.drain(..)) {
            pending.sink.notify(Err(Error::ShutdownAbandoned));
        }
        for (_, pending) in self.table.iter_mut() {
            pending.sink.notify(Err(Error::ShutdownAbandoned));
        }
        match self.cancel_all() {
            Ok(drained) => debug!(drained, "drained ring after failure"),
            Err(err) => {
                let leaked = self.table.len();
                error!(%err, leaked, "failed to drain ring, leaking in flight requests");
                std::mem::forget(std::mem::take(&mut self.table));
            }
        }
    }

    // Cancel every registered request and acknowledge completions until nothing is in flight,
    // without going through the table.
    fn cancel_all(&mut self) -> Result<usize> {
        let mut targets = self.table.tokens();
        let mut drained = 0;
        loop {
            while self.ring.capacity() > 0 {
                let Some(target) = targets.pop() else { break };
                // SAFETY: A cancellation references no memory.
                unsafe { self.ring.prepare(Op::cancel(target.as_u64()), ABORT_TOKEN)? };
            }
            if self.ring.submitted_count() == 0 && self.ring.prepared_count() == 0 {
                return Ok(drained);
            }
            self.ring.submit()?;
            let completion = self.ring.wait()?;
            self.ring.acknowledge(completion);
            drained += 1;
        }
    }

    // Anything still queued in the channel is abandoned through its sink when the receiver drops
    // with the waiter, this only makes the common case explicit.
    fn close(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Submit(_, mut sink) = command {
                sink.notify(Err(Error::ShutdownAbandoned));
            }
        }
        debug!(pools = self.pools.len(), "releasing registered buffer pools");
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use nix::sys::eventfd::EfdFlags;

    use super::*;
    use crate::{service::Outcome, sync::OneShot, test_util::ring};

    #[test]
    fn test_unknown_completion_aborts_and_abandons() {
        // Declared first so it outlives the waiter, which drains the ring before returning.
        let spec = Timespec::new().nsec(1_000_000);
        let Some(mut ring) = ring(8) else { return };
        // A completion the waiter never registered.
        unsafe { ring.prepare(Op::timeout(&spec), 0xdeadbeef).unwrap() };

        let (ours, _theirs) = UnixStream::pair().unwrap();
        let shot = OneShot::<Result<Outcome>>::new();
        let (tx, rx) = mpsc::channel();
        let recv = Operation::Recv {
            fd: ours.as_raw_fd(),
            buf: vec![0u8; 8],
        };
        tx.send(Command::Submit(recv, Sink::new(Box::new(shot.clone()))))
            .unwrap();
        let kick = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map(Arc::new)
            .unwrap();

        let result = Waiter::new(ring, rx, kick).run();
        assert!(matches!(result, Err(Error::UnknownCorrelation(0xdeadbeef))));
        // The receive never completed, it was abandoned and cancelled instead.
        assert!(matches!(shot.take(), Some(Err(Error::ShutdownAbandoned))));
        assert!(shot.take().is_none());
    }
}
