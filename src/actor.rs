//! # Actor Module
//!
//! An actor is a dedicated OS thread running one single-threaded cooperative
//! scheduler (a current-thread Tokio runtime driving a `LocalSet`).
//!
//! ## Lifecycle
//!
//! `Initial -[start()]-> Starting -[on_start callbacks]-> Running
//! -[stop() accepted]-> Stopping -[pending work drained, on_stop callbacks]-> Stopped`
//!
//! Work reaches the loop through a command channel (see the `bridge` module)
//! or is spawned from code already running on the loop with [`spawn_local`].
//! Every task spawned on the loop is tracked so that `stop()` can cancel it
//! (or, under [`DrainPolicy::Complete`], let it finish) and await the outcome
//! before the stop callbacks run.
//!
//! ## Callbacks
//!
//! `call_on_start` / `call_on_stop` append zero-argument closures from any
//! thread to a lock-free queue. They are drained on the actor thread at the
//! matching transition. A failing or panicking callback is logged and the
//! remaining callbacks still run.

use crate::error::{Result, SpiderError};
use crate::state::{ActorState, AtomicActorState};
use crossbeam::queue::SegQueue;
use futures_util::future::LocalBoxFuture;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, info_span, trace, warn, Span};

/// A zero-argument closure run at an actor lifecycle transition.
pub type Callback = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Builds the future for a unit of work on the target actor's thread.
pub(crate) type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send + 'static>;

pub(crate) enum Command {
    Run(Job),
    Stop,
}

/// What happens to work still pending on the loop when the actor stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Cancel every pending task and wait for the cancellation to be observed.
    #[default]
    Cancel,
    /// Let every pending task, including work already queued, run to completion.
    Complete,
}

/// Construction options for an [`Actor`].
#[derive(Debug, Clone, Default)]
pub struct ActorConfig {
    pub drain_policy: DrainPolicy,
    /// Span the actor's own span is nested under.
    pub parent_span: Option<Span>,
}

/// A thread-safe queue of lifecycle callbacks.
#[derive(Default)]
pub(crate) struct CallbackQueue(SegQueue<Callback>);

impl CallbackQueue {
    pub(crate) fn push(&self, callback: Callback) {
        self.0.push(callback);
    }

    /// Runs callbacks until the queue is empty, including any appended while
    /// draining.
    pub(crate) fn run_all(&self, owner: &str, phase: &str) {
        while let Some(callback) = self.0.pop() {
            match panic::catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(owner, "{} callback failed: {:#}", phase, e),
                Err(_) => error!(owner, "{} callback panicked", phase),
            }
        }
    }
}

struct Inner {
    name: String,
    state: AtomicActorState,
    stop_requested: AtomicBool,
    drain_policy: DrainPolicy,
    on_start: CallbackQueue,
    on_stop: CallbackQueue,
    tx: UnboundedSender<Command>,
    rx: Mutex<Option<UnboundedReceiver<Command>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    span: Span,
}

/// A cloneable handle to an actor.
#[derive(Clone)]
pub struct Actor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ActorConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ActorConfig) -> Self {
        let name = name.into();
        let span = match &config.parent_span {
            Some(parent) => info_span!(parent: parent, "actor", name = %name),
            None => info_span!("actor", name = %name),
        };
        let (tx, rx) = unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name,
                state: AtomicActorState::default(),
                stop_requested: AtomicBool::new(false),
                drain_policy: config.drain_policy,
                on_start: CallbackQueue::default(),
                on_stop: CallbackQueue::default(),
                tx,
                rx: Mutex::new(Some(rx)),
                thread: Mutex::new(None),
                span,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ActorState {
        self.inner.state.load()
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        self.inner.drain_policy
    }

    pub fn is_initial(&self) -> bool {
        self.state() == ActorState::Initial
    }

    pub fn is_running(&self) -> bool {
        self.state() == ActorState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ActorState::Stopped
    }

    /// Whether a stop has been requested or the loop has already wound down.
    pub fn is_stopping(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst) || !self.state().accepts_work()
    }

    /// Registers a callback to run on the actor thread before it starts
    /// processing work. Only allowed before `start()`.
    pub fn call_on_start<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if !self.is_initial() {
            return Err(SpiderError::invalid_state(
                self.name(),
                format!("start callbacks cannot be added in state {}", self.state()),
            ));
        }
        self.inner.on_start.push(Box::new(callback));
        Ok(())
    }

    /// Registers a callback to run on the actor thread once pending work has
    /// been drained at shutdown.
    pub fn call_on_stop<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if !self.state().accepts_work() {
            return Err(SpiderError::invalid_state(
                self.name(),
                format!("stop callbacks cannot be added in state {}", self.state()),
            ));
        }
        self.inner.on_stop.push(Box::new(callback));
        Ok(())
    }

    /// Spawns the actor thread.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.inner.thread.lock();
        if !self
            .inner
            .state
            .transition(ActorState::Initial, ActorState::Starting)
        {
            return Err(SpiderError::invalid_state(
                self.name(),
                format!("cannot start from state {}", self.state()),
            ));
        }
        let rx = self.inner.rx.lock().take().ok_or_else(|| {
            SpiderError::invalid_state(self.name(), "command receiver already taken")
        })?;

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || run_loop(inner, rx))
        {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.state.advance(ActorState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Requests loop termination. Safe to call from any thread, including the
    /// actor's own; a no-op when a stop is already underway.
    pub fn stop(&self) -> Result<()> {
        let state = self.state();
        if state == ActorState::Initial {
            return Err(SpiderError::invalid_state(self.name(), "actor was never started"));
        }
        if !state.accepts_work() || self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            trace!(actor = %self.inner.name, "stop already underway");
            return Ok(());
        }
        debug!(actor = %self.inner.name, "stop requested");
        // A closed channel means the loop is already gone.
        let _ = self.inner.tx.send(Command::Stop);
        Ok(())
    }

    /// Blocks until the actor thread has exited.
    pub fn join(&self) -> Result<()> {
        let handle = self.inner.thread.lock().take();
        match handle {
            Some(handle) => {
                if handle.thread().id() == thread::current().id() {
                    *self.inner.thread.lock() = Some(handle);
                    return Err(SpiderError::invalid_state(
                        self.name(),
                        "an actor cannot join its own thread",
                    ));
                }
                handle.join().map_err(|_| {
                    SpiderError::GeneralError(format!("actor '{}' thread panicked", self.name()))
                })
            }
            None if self.is_initial() => {
                Err(SpiderError::invalid_state(self.name(), "actor was never started"))
            }
            None => {
                // Another caller owns the join handle.
                while !self.is_stopped() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.is_stopping() {
            return Err(SpiderError::ActorStopped(self.inner.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        self.ensure_accepting()?;
        self.inner
            .tx
            .send(Command::Run(job))
            .map_err(|_| SpiderError::ActorStopped(self.inner.name.clone()))
    }
}

thread_local! {
    static LOCAL_TASKS: RefCell<Option<Rc<LocalTasks>>> = const { RefCell::new(None) };
}

/// Tasks spawned on the current actor's loop.
struct LocalTasks {
    actor: String,
    handles: RefCell<Vec<JoinHandle<()>>>,
    closed: Cell<bool>,
}

impl LocalTasks {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            handles: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        }
    }

    fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + 'static,
    {
        if self.closed.get() {
            return Err(SpiderError::ActorStopped(self.actor.clone()));
        }
        let handle = tokio::task::spawn_local(future);
        let mut handles = self.handles.borrow_mut();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    fn abort_all(&self) {
        for handle in self.handles.borrow().iter() {
            handle.abort();
        }
    }

    async fn join_all(&self) {
        loop {
            let batch = std::mem::take(&mut *self.handles.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(actor = %self.actor, "task panicked: {}", e);
                    }
                }
            }
        }
    }
}

/// Spawns a task on the loop of the actor owning the current thread.
///
/// Fails with [`SpiderError::NotInActor`] off an actor thread and with
/// [`SpiderError::ActorStopped`] once the actor has begun cancelling its work.
pub fn spawn_local<F>(future: F) -> Result<()>
where
    F: Future<Output = ()> + 'static,
{
    let tasks = LOCAL_TASKS.with(|cell| cell.borrow().clone());
    match tasks {
        Some(tasks) => tasks.spawn(future),
        None => Err(SpiderError::NotInActor),
    }
}

/// Whether the current thread is an actor thread.
pub fn in_actor() -> bool {
    LOCAL_TASKS.with(|cell| cell.borrow().is_some())
}

fn run_loop(inner: Arc<Inner>, mut rx: UnboundedReceiver<Command>) {
    let span = inner.span.clone();
    let _entered = span.enter();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build actor runtime: {}", e);
            inner.state.advance(ActorState::Stopping);
            inner.on_stop.run_all(&inner.name, "stop");
            inner.state.advance(ActorState::Stopped);
            return;
        }
    };
    let local = LocalSet::new();
    let tasks = Rc::new(LocalTasks::new(&inner.name));
    LOCAL_TASKS.with(|cell| *cell.borrow_mut() = Some(Rc::clone(&tasks)));

    {
        let _rt = runtime.enter();
        let _local = local.enter();
        inner.on_start.run_all(&inner.name, "start");
    }
    inner.state.advance(ActorState::Running);
    debug!("actor running");

    runtime.block_on(local.run_until(async {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Run(job) => {
                    if let Err(e) = tasks.spawn(job()) {
                        warn!("dropping work: {}", e);
                    }
                }
                Command::Stop => break,
            }
        }
    }));

    inner.state.advance(ActorState::Stopping);
    debug!(policy = ?inner.drain_policy, "actor stopping, draining pending work");

    runtime.block_on(local.run_until(async {
        rx.close();
        match inner.drain_policy {
            DrainPolicy::Cancel => {
                tasks.closed.set(true);
                tasks.abort_all();
                let mut dropped = 0usize;
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!("dropped {} queued units of work", dropped);
                }
            }
            DrainPolicy::Complete => {
                while let Ok(command) = rx.try_recv() {
                    if let Command::Run(job) = command {
                        let _ = tasks.spawn(job());
                    }
                }
            }
        }
        tasks.join_all().await;
        tasks.closed.set(true);
    }));
    drop(rx);

    LOCAL_TASKS.with(|cell| cell.borrow_mut().take());
    {
        let _rt = runtime.enter();
        drop(local);
        inner.on_stop.run_all(&inner.name, "stop");
    }
    drop(runtime);

    inner.state.advance(ActorState::Stopped);
    debug!("actor stopped");
}
