use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use crate::{sync::OneShot, Error, Result};

use super::Outcome;

type Map<T> = Box<dyn FnOnce(Outcome) -> Result<T> + Send>;

/// A future resolving to the typed result of a request submitted through one of the
/// [super::RingService] helpers.
///
/// Dropping a [Submission] only drops interest in the result, the request itself stays in flight
/// and is completed and cleaned up by the waiter as usual.
#[must_use = "futures do nothing unless polled"]
pub struct Submission<T> {
    shot: OneShot<Result<Outcome>>,
    map: Option<Map<T>>,
}

impl<T> Submission<T> {
    pub(super) fn new<F>(shot: OneShot<Result<Outcome>>, map: F) -> Submission<T>
    where
        F: FnOnce(Outcome) -> Result<T> + Send + 'static,
    {
        Submission {
            shot,
            map: Some(Box::new(map)),
        }
    }

    /// A submission that never reached the waiter.
    pub(super) fn failed(err: Error) -> Submission<T> {
        Submission {
            shot: OneShot::ready(Err(err)),
            map: None,
        }
    }
}

impl<T> Future for Submission<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.shot.poll_take(cx));
        let map = self.map.take();
        Poll::Ready(match (result, map) {
            (Ok(outcome), Some(map)) => map(outcome),
            (Ok(_), None) => Err(Error::Disconnected),
            (Err(err), _) => Err(err),
        })
    }
}

impl<T> fmt::Debug for Submission<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("pending", &self.shot.is_pending())
            .finish()
    }
}
