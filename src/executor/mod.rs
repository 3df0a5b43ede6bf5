//! The executor module holds the single capability the ring core needs from whatever threading
//! model hosts it: the ability to post a unit of work to some execution context. Continuations that
//! must resume on a particular context are delivered through an [Executor] instead of being run on
//! the waiter thread directly, see [crate::service::Posted].
//!
//! A [Strand] is provided as a minimal single threaded implementation, and
//! [futures::executor::ThreadPool] implements the trait out of the box.

mod strand;

use std::sync::Arc;

use futures::executor::ThreadPool;

pub use strand::{Strand, StrandBuilder};

/// A unit of work posted to an [Executor].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Post a unit of work to an execution context. Implementations decide where and when it runs,
/// but must run each posted unit exactly once unless the context itself has shut down.
pub trait Executor: Send + Sync + 'static {
    fn post(&self, work: Work);
}

impl Executor for ThreadPool {
    fn post(&self, work: Work) {
        self.spawn_ok(async move { work() });
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn post(&self, work: Work) {
        (**self).post(work)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_thread_pool_executor() {
        let pool = ThreadPool::builder().pool_size(1).create().unwrap();
        let (tx, rx) = mpsc::channel();
        Executor::post(&pool, Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_shared_executor() {
        let strand: Arc<dyn Executor> = Arc::new(Strand::new().unwrap());
        let (tx, rx) = mpsc::channel();
        strand.post(Box::new(move || tx.send("shared").unwrap()));
        assert_eq!(rx.recv().unwrap(), "shared");
    }
}
