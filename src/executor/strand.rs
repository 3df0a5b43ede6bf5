use std::{
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

use crossbeam_utils::sync::WaitGroup;
use tracing::{trace, warn};

use super::{Executor, Work};

/// A [Strand] is a single worker thread that runs posted work strictly in the order it was posted.
/// Anything confined to a strand therefore never runs concurrently with itself, which makes it a
/// natural home for callbacks that would otherwise need their own locking.
///
/// Handles are cheap to clone, the worker exits once the last handle is dropped and all work posted
/// before that has run.
pub struct Strand {
    state: Arc<StrandState>,
    wg: Option<WaitGroup>,
    released: bool,
}

/// Strand configuration object.
pub struct StrandBuilder {
    stack_size: usize,
    name: Option<String>,
    after_start: Option<Arc<dyn Fn() + Send + Sync>>,
    before_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[allow(dead_code)]
trait AssertSendSync: Send + Sync {}
impl AssertSendSync for Strand {}

struct StrandState {
    tx: Mutex<mpsc::Sender<Message>>,
    cnt: AtomicUsize,
    name: Option<String>,
}

enum Message {
    Run(Work),
    Close,
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand")
            .field("name", &self.state.name)
            .finish()
    }
}

impl fmt::Debug for StrandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrandBuilder")
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Strand {
    /// Creates a new strand with the default configuration.
    pub fn new() -> Result<Self, io::Error> {
        StrandBuilder::new().create()
    }

    /// Create a default strand configuration, which can then be customized.
    pub fn builder() -> StrandBuilder {
        StrandBuilder::new()
    }

    /// Queue a closure to run on the strand's worker thread.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.send(Message::Run(Box::new(work)));
    }

    /// Release this handle and block until the worker thread has exited. The worker exits once
    /// every handle has been released and the queued work ran.
    pub fn wait(mut self) {
        self.release();
        if let Some(wg) = self.wg.take() {
            wg.wait();
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.state.cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.send(Message::Close);
        }
    }
}

impl Executor for Strand {
    fn post(&self, work: Work) {
        self.state.send(Message::Run(work));
    }
}

impl StrandState {
    fn send(&self, msg: Message) {
        let sent = self
            .tx
            .lock()
            .expect("failed to lock strand sender: poisoned")
            .send(msg);
        if sent.is_err() {
            warn!(name = ?self.name, "strand worker gone, dropping posted work");
        }
    }

    fn work(
        &self,
        rx: mpsc::Receiver<Message>,
        after_start: Option<Arc<dyn Fn() + Send + Sync>>,
        before_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    ) {
        if let Some(after_start) = after_start {
            after_start();
        }
        while let Ok(msg) = rx.recv() {
            match msg {
                Message::Run(work) => work(),
                Message::Close => break,
            }
        }
        trace!(name = ?self.name, "strand worker exiting");
        if let Some(before_stop) = before_stop {
            before_stop();
        }
    }
}

impl Clone for Strand {
    fn clone(&self) -> Self {
        self.state.cnt.fetch_add(1, Ordering::Relaxed);
        Self {
            state: self.state.clone(),
            wg: self.wg.clone(),
            released: false,
        }
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        self.release();
    }
}

impl StrandBuilder {
    /// Create a default strand configuration.
    ///
    /// See the other methods on this type for details on the defaults.
    pub fn new() -> Self {
        Self {
            stack_size: 0,
            name: None,
            after_start: None,
            before_stop: None,
        }
    }

    /// Set stack size of the worker thread, in bytes.
    ///
    /// By default, the worker thread uses Rust's standard stack size.
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the name of the worker thread.
    pub fn name<S: Into<String>>(&mut self, name: S) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Execute the closure `f` on the worker thread before it runs any posted work.
    pub fn after_start<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.after_start = Some(Arc::new(f));
        self
    }

    /// Execute the closure `f` on the worker thread just before it exits.
    pub fn before_stop<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_stop = Some(Arc::new(f));
        self
    }

    /// Create a [`Strand`](Strand) with the given configuration.
    pub fn create(&mut self) -> Result<Strand, io::Error> {
        let (tx, rx) = mpsc::channel();
        let wg = WaitGroup::new();
        let state = Arc::new(StrandState {
            tx: Mutex::new(tx),
            cnt: AtomicUsize::new(1),
            name: self.name.clone(),
        });

        let mut thread_builder = thread::Builder::new();
        if let Some(ref name) = self.name {
            thread_builder = thread_builder.name(name.clone());
        }
        if self.stack_size > 0 {
            thread_builder = thread_builder.stack_size(self.stack_size);
        }

        let worker_state = state.clone();
        let worker_wg = wg.clone();
        let after_start = self.after_start.clone();
        let before_stop = self.before_stop.clone();
        thread_builder.spawn(move || {
            worker_state.work(rx, after_start, before_stop);
            drop(worker_wg)
        })?;

        Ok(Strand {
            state,
            wg: Some(wg),
            released: false,
        })
    }
}

impl Default for StrandBuilder {
    fn default() -> Self {
        Self::new()
    }
}
