//! The reactor: a single dedicated thread that executes posted work in FIFO order.
//!
//! A [`Reactor`] owns a tokio current-thread runtime driven by its worker thread. Work
//! items posted from any thread are drained in submission order inside that runtime, and
//! the socket and listener I/O futures spawned onto it post their completions back as
//! work items. Every state transition and every application callback of the connections
//! sharing a reactor therefore executes serialized on one thread.
//!
//! A panic escaping a posted action terminates the reactor: the failure is logged,
//! reported once through [`ReactorHandler::on_error`], the stopped notification fires and
//! all later work is discarded, since connection state touched by a half-executed action
//! cannot be trusted afterwards.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use thiserror::Error;
use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{error, info, trace};

use crate::utils::lock;

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

enum Work {
    Run(WorkItem),
    Stop,
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor {name} has already been started")]
    AlreadyStarted { name: String },

    #[error("posted action panicked: {message}")]
    ActionPanicked { message: String },

    #[error("can't join the reactor from its own thread")]
    JoinFromReactor,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Reactor-level notifications.
pub trait ReactorHandler: Send + Sync + 'static {
    /// The worker loop has exited; no further work will run.
    fn on_stopped(&self) {}

    /// A posted action panicked; the reactor is terminating.
    fn on_error(&self, _error: &ReactorError) {}
}

/// Handle to a reactor; clones share the same worker thread.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    sender: mpsc::UnboundedSender<Work>,
    handle: runtime::Handle,
    launch: Mutex<Option<(Runtime, mpsc::UnboundedReceiver<Work>)>>,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
    handler: Mutex<Option<Arc<dyn ReactorHandler>>>,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        Self::named("reactor")
    }

    /// Creates a reactor whose worker thread carries `name`.
    pub fn named<S: Into<String>>(name: S) -> Result<Self, ReactorError> {
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (sender, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                sender,
                handle,
                launch: Mutex::new(Some((runtime, receiver))),
                started: AtomicBool::new(false),
                thread: Mutex::new(None),
                thread_id: OnceLock::new(),
                handler: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set_handler(&self, handler: Arc<dyn ReactorHandler>) {
        *lock(&self.inner.handler) = Some(handler);
    }

    /// Spawns the worker thread. A reactor can be started only once.
    pub fn start(&self) -> Result<(), ReactorError> {
        let Some((runtime, receiver)) = lock(&self.inner.launch).take() else {
            return Err(ReactorError::AlreadyStarted { name: self.inner.name.clone() });
        };

        let inner = Arc::clone(&self.inner);
        let thread = thread::Builder::new().name(self.inner.name.clone()).spawn(move || run(&inner, runtime, receiver))?;

        self.inner.started.store(true, Ordering::Release);
        *lock(&self.inner.thread) = Some(thread);
        Ok(())
    }

    /// Enqueues `action` for execution on the reactor thread.
    ///
    /// Safe to call from any thread, including from inside a running action. Actions
    /// posted once the reactor has stopped are discarded.
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.sender.send(Work::Run(Box::new(action))).is_err() {
            trace!(reactor = %self.inner.name, "reactor stopped, posted action discarded");
        }
    }

    /// Enqueues the stop sentinel.
    ///
    /// Everything enqueued before the sentinel is processed still runs; anything posted
    /// afterwards is discarded.
    pub fn stop(&self) {
        if self.inner.sender.send(Work::Stop).is_err() {
            trace!(reactor = %self.inner.name, "reactor already stopped");
        }
    }

    /// Waits for the worker thread to exit.
    pub fn join(&self) -> Result<(), ReactorError> {
        if self.is_reactor_thread() {
            return Err(ReactorError::JoinFromReactor);
        }

        let thread = lock(&self.inner.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(reactor = %self.inner.name, "reactor thread panicked");
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.sender.is_closed()
    }

    /// Whether the calling thread is this reactor's worker thread.
    pub fn is_reactor_thread(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    /// Spawns an I/O future onto the reactor's runtime.
    ///
    /// The future runs on the reactor thread; it must hand its outcome back with
    /// [`Reactor::post`] rather than calling into connection state directly.
    pub(crate) fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(future).abort_handle()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor").field("name", &self.inner.name).field("running", &self.is_running()).finish()
    }
}

fn run(inner: &Inner, runtime: Runtime, mut receiver: mpsc::UnboundedReceiver<Work>) {
    // set before the first action runs; the launch slot is taken exactly once
    if inner.thread_id.set(thread::current().id()).is_err() {
        trace!(reactor = %inner.name, "reactor thread id already recorded");
    }
    info!(reactor = %inner.name, "reactor started");

    let failure = runtime.block_on(async {
        while let Some(work) = receiver.recv().await {
            match work {
                Work::Run(action) => {
                    if let Err(error) = execute(action) {
                        return Some(error);
                    }
                }
                Work::Stop => {
                    // refuse new work, then run whatever was enqueued before the sentinel got here
                    receiver.close();
                    while let Ok(work) = receiver.try_recv() {
                        if let Work::Run(action) = work {
                            if let Err(error) = execute(action) {
                                return Some(error);
                            }
                        }
                    }
                    return None;
                }
            }
        }
        None
    });

    drop(receiver);
    // cancels the I/O futures still parked on the runtime
    drop(runtime);

    let handler = lock(&inner.handler).clone();
    if let Some(error) = failure {
        error!(reactor = %inner.name, cause = %error, "reactor terminated by a failing action");
        if let Some(handler) = &handler {
            handler.on_error(&error);
        }
    }

    info!(reactor = %inner.name, "reactor stopped");
    if let Some(handler) = handler {
        handler.on_stopped();
    }
}

fn execute(action: WorkItem) -> Result<(), ReactorError> {
    panic::catch_unwind(AssertUnwindSafe(action))
        .map_err(|payload| ReactorError::ActionPanicked { message: panic_message(payload.as_ref()) })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
