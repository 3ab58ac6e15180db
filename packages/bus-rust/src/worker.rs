//! Fixed-size pool of long-running workers over per-worker state.
//!
//! A `WorkerGroup<S>` runs `min_workers` tokio tasks in one of two modes:
//! an *activity* loop that calls [`WorkerActivity::run`] until cancelled, or
//! a *queue* loop that consumes [`WorkItem`]s from a shared unbounded queue.
//! Each task builds its own `S` through the [`WorkerStateFactory`] and drops
//! it exactly once when the loop exits.
//!
//! Every start or restart opens a new run epoch with its own
//! `CancellationToken`. Cancellation is cooperative: loops observe it at
//! iteration boundaries, so an in-flight iteration always finishes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BusError;

/// Pause between restart-policy polls that refused the restart.
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Callback traits
// ---------------------------------------------------------------------------

/// Creates the state a single worker loop operates on.
#[async_trait]
pub trait WorkerStateFactory<S: Send + 'static>: Send + Sync + 'static {
    /// Builds the state for worker number `worker`.
    async fn create(&self, worker: usize) -> Result<S, BusError>;
}

#[async_trait]
impl<S, F> WorkerStateFactory<S> for F
where
    S: Send + 'static,
    F: Fn(usize) -> Result<S, BusError> + Send + Sync + 'static,
{
    async fn create(&self, worker: usize) -> Result<S, BusError> {
        self(worker)
    }
}

/// Decides whether a restart may proceed. Polled until it returns `true`.
#[async_trait]
pub trait RestartPolicy: Send + Sync + 'static {
    async fn try_restart(&self) -> bool;
}

#[async_trait]
impl<F> RestartPolicy for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    async fn try_restart(&self) -> bool {
        self()
    }
}

/// Body of an activity-mode loop. Called repeatedly until the epoch ends.
///
/// Failures are the activity's own business; the loop keeps going.
#[async_trait]
pub trait WorkerActivity<S: Send + 'static>: Send + Sync + 'static {
    async fn run(&self, state: &mut S);
}

/// A unit of work consumed by a queue-mode loop.
#[async_trait]
pub trait WorkItem<S: Send + 'static>: Send + 'static {
    async fn run(self: Box<Self>, state: &mut S);
}

#[async_trait]
impl<S, F> WorkItem<S> for F
where
    S: Send + 'static,
    F: FnOnce(&mut S) + Send + 'static,
{
    async fn run(self: Box<Self>, state: &mut S) {
        (*self)(state);
    }
}

type BoxedItem<S> = Box<dyn WorkItem<S>>;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Callbacks<S: Send + 'static> {
    factory: Arc<dyn WorkerStateFactory<S>>,
    restart: Arc<dyn RestartPolicy>,
}

impl<S: Send + 'static> Clone for Callbacks<S> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            restart: Arc::clone(&self.restart),
        }
    }
}

enum Mode<S: Send + 'static> {
    Activity(Arc<dyn WorkerActivity<S>>),
    Queue,
}

impl<S: Send + 'static> Clone for Mode<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Activity(activity) => Self::Activity(Arc::clone(activity)),
            Self::Queue => Self::Queue,
        }
    }
}

/// One run of the worker tasks, from start (or restart) to cancellation.
struct Epoch {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Lifecycle<S: Send + 'static> {
    callbacks: Option<Callbacks<S>>,
    mode: Option<Mode<S>>,
    epoch: Option<Epoch>,
    restarting: bool,
    disposed: bool,
}

struct Inner<S: Send + 'static> {
    min_workers: usize,
    max_workers: usize,
    lifecycle: Mutex<Lifecycle<S>>,
    queue_tx: mpsc::UnboundedSender<BoxedItem<S>>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxedItem<S>>>>,
    /// Parent of every epoch token; cancelled on dispose.
    disposed: CancellationToken,
    /// Signalled whenever a restart clears `Lifecycle::restarting`.
    restart_finished: Notify,
}

// ---------------------------------------------------------------------------
// WorkerGroup
// ---------------------------------------------------------------------------

/// Pool of `min_workers` long-running tasks sharing a lifecycle.
///
/// Must be started from within a tokio runtime. Dropping the group disposes it.
pub struct WorkerGroup<S: Send + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: Send + 'static> WorkerGroup<S> {
    /// Creates an idle group.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidArgument` if `min_workers` is zero or
    /// `max_workers < min_workers`.
    pub fn new(min_workers: usize, max_workers: usize) -> Result<Self, BusError> {
        if min_workers == 0 {
            return Err(BusError::invalid_argument(
                "min_workers",
                "the minimum number of workers is 1",
            ));
        }
        if max_workers < min_workers {
            return Err(BusError::invalid_argument(
                "max_workers",
                format!("must be at least min_workers ({min_workers})"),
            ));
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                min_workers,
                max_workers,
                lifecycle: Mutex::new(Lifecycle {
                    callbacks: None,
                    mode: None,
                    epoch: None,
                    restarting: false,
                    disposed: false,
                }),
                queue_tx,
                queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
                disposed: CancellationToken::new(),
                restart_finished: Notify::new(),
            }),
        })
    }

    #[must_use]
    pub fn min_workers(&self) -> usize {
        self.inner.min_workers
    }

    /// Accepted for configuration parity; pools always run `min_workers` tasks.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Registers the state factory and restart policy. Allowed once.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` if already initialized, `BusError::Disposed`
    /// after disposal.
    pub fn initialize(
        &self,
        state_factory: impl WorkerStateFactory<S>,
        restart_policy: impl RestartPolicy,
    ) -> Result<(), BusError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.disposed {
            return Err(BusError::Disposed("worker group"));
        }
        if lifecycle.callbacks.is_some() {
            return Err(BusError::InvalidOperation("worker group already initialized"));
        }
        lifecycle.callbacks = Some(Callbacks {
            factory: Arc::new(state_factory),
            restart: Arc::new(restart_policy),
        });
        Ok(())
    }

    /// Starts `min_workers` loops that call `activity` until cancelled.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` if not initialized or already started,
    /// `BusError::Disposed` after disposal.
    pub fn start_activity(&self, activity: impl WorkerActivity<S>) -> Result<(), BusError> {
        self.start(Mode::Activity(Arc::new(activity)))
    }

    /// Starts `min_workers` loops consuming the shared work queue.
    ///
    /// # Errors
    ///
    /// Same as [`WorkerGroup::start_activity`].
    pub fn start_queue(&self) -> Result<(), BusError> {
        self.start(Mode::Queue)
    }

    fn start(&self, mode: Mode<S>) -> Result<(), BusError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.disposed {
            return Err(BusError::Disposed("worker group"));
        }
        let Some(callbacks) = lifecycle.callbacks.clone() else {
            return Err(BusError::InvalidOperation("worker group not initialized"));
        };
        if lifecycle.mode.is_some() {
            return Err(BusError::InvalidOperation("worker group already started"));
        }

        lifecycle.epoch = Some(self.inner.spawn_epoch(&callbacks, &mode));
        lifecycle.mode = Some(mode);
        Ok(())
    }

    /// Appends an item to the work queue. Allowed before the queue is started.
    ///
    /// # Errors
    ///
    /// `BusError::Disposed` after disposal.
    pub fn enqueue(&self, item: impl WorkItem<S>) -> Result<(), BusError> {
        if self.inner.disposed.is_cancelled() {
            return Err(BusError::Disposed("worker group"));
        }
        self.inner
            .queue_tx
            .send(Box::new(item))
            .map_err(|_| BusError::Disposed("worker group"))
    }

    /// Cancels the current epoch, waits for its loops to exit, polls the
    /// restart policy until it agrees, then starts the original mode again.
    ///
    /// A restart requested while another is in progress is a no-op.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` if never started, `BusError::Disposed`
    /// if the group is disposed before or during the restart.
    pub async fn restart(&self) -> Result<(), BusError> {
        Arc::clone(&self.inner).restart().await
    }

    /// Handle that lets a worker restart its own group without keeping it alive.
    #[must_use]
    pub fn restart_handle(&self) -> RestartHandle {
        RestartHandle {
            inner: Arc::downgrade(&self.inner) as Weak<dyn Restartable>,
        }
    }

    /// Whether a run epoch is active.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.lifecycle.lock().epoch.is_some()
    }

    /// Number of worker tasks of the current epoch that are still running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.inner
            .lifecycle
            .lock()
            .epoch
            .as_ref()
            .map_or(0, |epoch| epoch.handles.iter().filter(|h| !h.is_finished()).count())
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Cancels the active epoch. Loops exit at their next iteration boundary.
    /// Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Disposes the group and waits for every loop to exit, including the
    /// loops of an epoch that an in-progress restart is still draining.
    pub async fn shutdown(&self) {
        self.inner.dispose();
        loop {
            let finished = self.inner.restart_finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            let (epoch, restarting) = {
                let mut lifecycle = self.inner.lifecycle.lock();
                (lifecycle.epoch.take(), lifecycle.restarting)
            };
            if let Some(epoch) = epoch {
                for handle in epoch.handles {
                    let _ = handle.await;
                }
            }
            if !restarting {
                return;
            }
            finished.await;
        }
    }
}

impl<S: Send + 'static> Drop for WorkerGroup<S> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<S: Send + 'static> Inner<S> {
    fn spawn_epoch(&self, callbacks: &Callbacks<S>, mode: &Mode<S>) -> Epoch {
        let token = self.disposed.child_token();
        let handles = (0..self.min_workers)
            .map(|worker| {
                let factory = Arc::clone(&callbacks.factory);
                let token = token.clone();
                match mode {
                    Mode::Activity(activity) => {
                        tokio::spawn(activity_loop(worker, factory, Arc::clone(activity), token))
                    }
                    Mode::Queue => {
                        tokio::spawn(queue_loop(worker, factory, Arc::clone(&self.queue_rx), token))
                    }
                }
            })
            .collect();
        debug!(workers = self.min_workers, "worker epoch started");
        Epoch { token, handles }
    }

    fn dispose(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.disposed {
                return;
            }
            lifecycle.disposed = true;
        }
        self.disposed.cancel();
        debug!("worker group disposed");
    }

    async fn restart(self: Arc<Self>) -> Result<(), BusError> {
        let (epoch, callbacks, mode) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.disposed {
                return Err(BusError::Disposed("worker group"));
            }
            let (Some(mode), Some(callbacks)) = (lifecycle.mode.clone(), lifecycle.callbacks.clone())
            else {
                return Err(BusError::InvalidOperation("worker group not started"));
            };
            if lifecycle.restarting {
                return Ok(());
            }
            lifecycle.restarting = true;
            (lifecycle.epoch.take(), callbacks, mode)
        };

        if let Some(epoch) = epoch {
            epoch.token.cancel();
            for handle in epoch.handles {
                let _ = handle.await;
            }
        }

        while !self.disposed.is_cancelled() {
            if callbacks.restart.try_restart().await {
                break;
            }
            tokio::select! {
                () = self.disposed.cancelled() => {}
                () = tokio::time::sleep(RESTART_POLL_INTERVAL) => {}
            }
        }

        let outcome = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.restarting = false;
            if lifecycle.disposed {
                Err(BusError::Disposed("worker group"))
            } else {
                lifecycle.epoch = Some(self.spawn_epoch(&callbacks, &mode));
                debug!("worker group restarted");
                Ok(())
            }
        };
        self.restart_finished.notify_waiters();
        outcome
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn activity_loop<S: Send + 'static>(
    worker: usize,
    factory: Arc<dyn WorkerStateFactory<S>>,
    activity: Arc<dyn WorkerActivity<S>>,
    token: CancellationToken,
) {
    let mut state = match factory.create(worker).await {
        Ok(state) => state,
        Err(err) => {
            warn!(worker, error = %err, "worker state creation failed");
            return;
        }
    };

    while !token.is_cancelled() {
        activity.run(&mut state).await;
        tokio::task::yield_now().await;
    }

    drop(state);
    debug!(worker, "activity loop stopped");
}

async fn queue_loop<S: Send + 'static>(
    worker: usize,
    factory: Arc<dyn WorkerStateFactory<S>>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxedItem<S>>>>,
    token: CancellationToken,
) {
    let mut state = match factory.create(worker).await {
        Ok(state) => state,
        Err(err) => {
            warn!(worker, error = %err, "worker state creation failed");
            return;
        }
    };

    loop {
        // Dequeue is cancel-safe: a cancelled wait leaves the item queued.
        let item = tokio::select! {
            biased;
            () = token.cancelled() => None,
            item = async { queue.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };
        item.run(&mut state).await;
        tokio::task::yield_now().await;
    }

    drop(state);
    debug!(worker, "queue loop stopped");
}

// ---------------------------------------------------------------------------
// RestartHandle
// ---------------------------------------------------------------------------

trait Restartable: Send + Sync {
    fn spawn_restart(self: Arc<Self>);
}

impl<S: Send + 'static> Restartable for Inner<S> {
    fn spawn_restart(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(err) = self.restart().await {
                debug!(error = %err, "scheduled restart skipped");
            }
        });
    }
}

/// Weak handle used by workers to schedule a restart of their own group.
#[derive(Clone)]
pub struct RestartHandle {
    inner: Weak<dyn Restartable>,
}

impl RestartHandle {
    /// Schedules a restart on a separate task. Returns `false` if the group is gone.
    pub fn schedule(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.spawn_restart();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RestartHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
