use std::{
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

#[derive(Debug)]
enum OneShotInner<T> {
    Pending,
    Complete(T),
    Finalized,
}

impl<T> OneShotInner<T> {
    pub fn new() -> OneShotInner<T> {
        OneShotInner::Pending
    }

    pub fn complete(&mut self, val: T) {
        use OneShotInner::*;
        match self {
            Finalized => panic!("invalid state can not call complete on finalized one shot."),
            Complete(..) => panic!("invalid state can not call complete more than once."),
            _ => *self = Complete(val),
        };
    }

    fn unwrap(self) -> T {
        use OneShotInner::*;
        match self {
            Pending | Finalized => unreachable!("unwrap called on pending/finalized OneShot"),
            Complete(val) => val,
        }
    }

    pub fn take(&mut self) -> Option<T> {
        use OneShotInner::*;
        match self {
            Pending | Finalized => None,
            _ => Some(std::mem::replace(self, OneShotInner::Finalized).unwrap()),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, OneShotInner::Pending)
    }
}

/// A single writer, single reader notification primitive. One clone lives with the waiting
/// consumer, the other is handed to the waiter thread which completes it exactly once and wakes
/// whichever task last registered its [Waker]. The waker is what carries the resumption back onto
/// the consumer's own executor.
#[derive(Debug)]
pub struct OneShot<T> {
    inner: Arc<Mutex<OneShotInner<T>>>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl<T> OneShot<T> {
    pub fn new() -> OneShot<T> {
        OneShot {
            inner: Arc::new(Mutex::new(OneShotInner::new())),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an already completed [OneShot].
    pub fn ready(val: T) -> OneShot<T> {
        let shot = OneShot::new();
        shot.complete(val);
        shot
    }

    fn lock_inner(&self) -> MutexGuard<'_, OneShotInner<T>> {
        self.inner
            .lock()
            .expect("failed to lock oneshot result: poisoned")
    }

    fn lock_waker(&self) -> MutexGuard<'_, Option<Waker>> {
        self.waker
            .lock()
            .expect("failed to lock oneshot waker: poisoned")
    }

    /// Store the value and wake the waiting task.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub fn complete(&self, val: T) {
        self.lock_inner().complete(val);
        if let Some(waker) = self.lock_waker().take() {
            waker.wake()
        }
    }

    pub fn take(&self) -> Option<T> {
        self.lock_inner().take()
    }

    pub fn set_waker(&self, waker: Waker) {
        self.lock_waker().replace(waker);
    }

    /// Whether the value is still outstanding.
    pub fn is_pending(&self) -> bool {
        self.lock_inner().is_pending()
    }

    /// Register the task's waker and take the value if it already arrived.
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<T> {
        self.set_waker(cx.waker().clone());
        match self.take() {
            Some(val) => Poll::Ready(val),
            None => Poll::Pending,
        }
    }
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        OneShot::new()
    }
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        OneShot {
            inner: self.inner.clone(),
            waker: self.waker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use futures::task::{waker, ArcWake};

    use super::*;

    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_once() {
        let shot = OneShot::new();
        assert!(shot.is_pending());
        assert_eq!(shot.take(), None);

        shot.clone().complete(5);
        assert!(!shot.is_pending());
        assert_eq!(shot.take(), Some(5));
        assert_eq!(shot.take(), None);
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn test_double_complete_panics() {
        let shot = OneShot::new();
        shot.complete(1);
        shot.complete(2);
    }

    #[test]
    fn test_complete_wakes_registered_task() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = waker(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let shot = OneShot::new();
        assert!(shot.poll_take(&mut cx).is_pending());

        let writer = shot.clone();
        thread::spawn(move || writer.complete("done"))
            .join()
            .unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(shot.poll_take(&mut cx), Poll::Ready("done"));
    }

    #[test]
    fn test_ready() {
        let shot = OneShot::ready(3);
        assert_eq!(shot.take(), Some(3));
    }
}
