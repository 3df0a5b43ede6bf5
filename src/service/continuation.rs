use std::{fmt, sync::mpsc};

use tracing::{debug, trace};

use crate::{executor::Executor, sync::OneShot, Error, Result};

use super::Outcome;

/// The resumption point of a logical caller waiting on a request. The waiter thread calls
/// [Continuation::notify] exactly once per request, with the outcome or the error that ended it.
///
/// Implementations decide where the caller resumes:
/// - [OneShot] wakes a task polling the matching [super::Submission] future.
/// - [Callback] runs a closure inline on the waiter thread, it must not block.
/// - [Posted] hands a closure to an [Executor].
/// - [mpsc::Sender] feeds a thread blocked on the receiving end.
pub trait Continuation: Send + 'static {
    fn notify(self: Box<Self>, result: Result<Outcome>);
}

impl Continuation for OneShot<Result<Outcome>> {
    fn notify(self: Box<Self>, result: Result<Outcome>) {
        self.complete(result)
    }
}

impl Continuation for mpsc::Sender<Result<Outcome>> {
    fn notify(self: Box<Self>, result: Result<Outcome>) {
        if self.send(result).is_err() {
            debug!("continuation receiver dropped, discarding outcome");
        }
    }
}

/// A closure run inline on the waiter thread.
pub struct Callback<F> {
    f: F,
}

impl<F> Callback<F>
where
    F: FnOnce(Result<Outcome>) + Send + 'static,
{
    pub fn new(f: F) -> Callback<F> {
        Callback { f }
    }
}

impl<F> Continuation for Callback<F>
where
    F: FnOnce(Result<Outcome>) + Send + 'static,
{
    fn notify(self: Box<Self>, result: Result<Outcome>) {
        (self.f)(result)
    }
}

/// A closure marshalled onto an [Executor] together with the result.
pub struct Posted<E, F> {
    executor: E,
    f: F,
}

impl<E, F> Posted<E, F>
where
    E: Executor,
    F: FnOnce(Result<Outcome>) + Send + 'static,
{
    pub fn new(executor: E, f: F) -> Posted<E, F> {
        Posted { executor, f }
    }
}

impl<E, F> Continuation for Posted<E, F>
where
    E: Executor,
    F: FnOnce(Result<Outcome>) + Send + 'static,
{
    fn notify(self: Box<Self>, result: Result<Outcome>) {
        let Posted { executor, f } = *self;
        executor.post(Box::new(move || f(result)));
    }
}

/// Owns a request's continuation on its way through the waiter and guarantees it is notified
/// exactly once. A sink dropped before being notified, because the request was dropped with a
/// channel or a table, reports [Error::ShutdownAbandoned].
pub(super) struct Sink(Option<Box<dyn Continuation>>);

impl Sink {
    pub(super) fn new(continuation: Box<dyn Continuation>) -> Sink {
        Sink(Some(continuation))
    }

    /// A sink for the waiter's own bookkeeping requests.
    pub(super) fn none() -> Sink {
        Sink(None)
    }

    pub(super) fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    pub(super) fn notify(&mut self, result: Result<Outcome>) {
        match self.0.take() {
            Some(continuation) => continuation.notify(result),
            None => {
                if let Ok(outcome) = result {
                    trace!(token = %outcome.token, "outcome without continuation discarded");
                }
            }
        }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if let Some(continuation) = self.0.take() {
            continuation.notify(Err(Error::ShutdownAbandoned));
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sink").field(&self.is_armed()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{correlation::CorrelationTable, executor::Strand};

    fn outcome(value: u32) -> Outcome {
        Outcome {
            token: CorrelationTable::new().register(()),
            value,
            flags: 0,
            slot: None,
            buf: None,
            fd: None,
        }
    }

    #[test]
    fn test_sink_notifies_once() {
        let shot = OneShot::new();
        let mut sink = Sink::new(Box::new(shot.clone()));
        sink.notify(Ok(outcome(3)));
        sink.notify(Ok(outcome(4)));
        drop(sink);

        assert_eq!(shot.take().unwrap().unwrap().value, 3);
        assert!(shot.take().is_none());
    }

    #[test]
    fn test_dropped_sink_reports_abandoned() {
        let (tx, rx) = mpsc::channel();
        drop(Sink::new(Box::new(tx)));
        assert!(matches!(rx.recv().unwrap(), Err(Error::ShutdownAbandoned)));
    }

    #[test]
    fn test_callback_runs_inline() {
        let seen = Arc::new(Mutex::new(None));
        let inner = seen.clone();
        let callback = Box::new(Callback::new(move |result: Result<Outcome>| {
            *inner.lock().unwrap() = Some(result.unwrap().value);
        }));
        callback.notify(Ok(outcome(11)));
        assert_eq!(*seen.lock().unwrap(), Some(11));
    }

    #[test]
    fn test_posted_runs_on_executor() {
        let strand = Strand::builder().name("posted-test").create().unwrap();
        let (tx, rx) = mpsc::channel();
        let posted = Box::new(Posted::new(strand.clone(), move |result: Result<Outcome>| {
            let name = std::thread::current().name().map(String::from);
            tx.send((name, result.unwrap().value)).unwrap();
        }));
        posted.notify(Ok(outcome(5)));

        let (name, value) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("posted-test"));
        assert_eq!(value, 5);
        strand.wait();
    }
}
