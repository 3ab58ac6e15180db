//! Channel groups: the connection lifecycle and receive workers of one
//! configured group.
//!
//! A group is initialized once (one probe connection plus a single retry),
//! then either dispatches (dispatch-only groups) or receives through a
//! [`WorkerGroup`] of `min_workers` loops, one decorated channel each. A
//! worker that loses its connection schedules a restart of the whole pool;
//! the restart waits on a [`ReconnectProbe`] that follows the reconnect
//! backoff until the transport answers again.

pub mod poison;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ChannelEnvelope, ChannelGroupConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::channel::{
    ChannelConnector, ChannelStack, ChannelTransaction, DeliveryHandler, MessagingChannel,
};
use crate::dispatch::PublishRouter;
use crate::error::BusError;
use crate::worker::{RestartHandle, RestartPolicy, WorkerActivity, WorkerGroup, WorkerStateFactory};

pub use poison::{DeliveryGuard, FailureRecord, FailureTracker};

/// Lifecycle state of a [`ChannelGroup`], derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Uninitialized,
    Initialized,
    Dispatching,
    Receiving,
    Disposed,
}

#[derive(Debug, Default)]
struct Flags {
    initialized: bool,
    dispatching: bool,
    receiving: bool,
    disposed: bool,
}

impl Flags {
    fn state(&self) -> GroupState {
        if self.disposed {
            GroupState::Disposed
        } else if self.receiving {
            GroupState::Receiving
        } else if self.dispatching {
            GroupState::Dispatching
        } else if self.initialized {
            GroupState::Initialized
        } else {
            GroupState::Uninitialized
        }
    }

    fn ensure_ready(&self) -> Result<(), BusError> {
        if self.disposed {
            return Err(BusError::Disposed("channel group"));
        }
        if !self.initialized {
            return Err(BusError::InvalidOperation("channel group not initialized"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel source
// ---------------------------------------------------------------------------

/// Opens decorated channels for the group and tracks the ones in use.
struct ChannelSource {
    connector: Arc<dyn ChannelConnector>,
    config: Arc<ChannelGroupConfig>,
    stack: ChannelStack,
    /// Connected channels waiting for a worker.
    established: Mutex<Vec<Arc<dyn MessagingChannel>>>,
    /// Channels held by running workers.
    live: DashMap<usize, Arc<dyn MessagingChannel>>,
    next_id: AtomicUsize,
}

impl ChannelSource {
    async fn connect(&self) -> Result<Arc<dyn MessagingChannel>, BusError> {
        let channel = self.connector.connect(&self.config.group_name).await?;
        Ok(self.stack.decorate(channel))
    }

    async fn checkout(self: &Arc<Self>) -> Result<WorkerChannel, BusError> {
        let idle = self.established.lock().pop();
        let channel = match idle {
            Some(channel) => channel,
            None => self.connect().await?,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, Arc::clone(&channel));
        Ok(WorkerChannel {
            id,
            channel,
            faulted: false,
            source: Arc::clone(self),
        })
    }

    fn discard_established(&self) {
        let idle = std::mem::take(&mut *self.established.lock());
        for channel in idle {
            channel.dispose();
        }
    }

    fn begin_shutdown(&self) {
        for channel in self.live.iter() {
            channel.value().begin_shutdown();
        }
    }
}

/// Per-worker state: the channel a receive loop owns. Disposed on drop.
pub struct WorkerChannel {
    id: usize,
    channel: Arc<dyn MessagingChannel>,
    faulted: bool,
    source: Arc<ChannelSource>,
}

impl WorkerChannel {
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn MessagingChannel> {
        &self.channel
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.source.live.remove(&self.id);
        self.channel.dispose();
    }
}

struct WorkerChannelFactory {
    source: Arc<ChannelSource>,
}

#[async_trait]
impl WorkerStateFactory<WorkerChannel> for WorkerChannelFactory {
    async fn create(&self, worker: usize) -> Result<WorkerChannel, BusError> {
        let slot = self.source.checkout().await?;
        debug!(group = %self.source.config.group_name, worker, "worker channel ready");
        Ok(slot)
    }
}

// ---------------------------------------------------------------------------
// Receive activity and reconnect probe
// ---------------------------------------------------------------------------

struct ReceiveActivity {
    handler: Arc<dyn DeliveryHandler>,
    restart: RestartHandle,
    idle: Duration,
    group: String,
}

#[async_trait]
impl WorkerActivity<WorkerChannel> for ReceiveActivity {
    async fn run(&self, worker: &mut WorkerChannel) {
        if worker.faulted {
            tokio::time::sleep(self.idle).await;
            return;
        }

        match worker.channel.receive(Arc::clone(&self.handler)).await {
            Ok(()) => {}
            Err(err) if err.is_connection() => {
                warn!(group = %self.group, error = %err, "connection lost; restarting workers");
                worker.faulted = true;
                if !self.restart.schedule() {
                    debug!(group = %self.group, "worker group gone; restart skipped");
                }
            }
            Err(BusError::Disposed(what)) => {
                debug!(group = %self.group, what, "worker channel disposed");
                worker.faulted = true;
            }
            Err(err) => {
                warn!(group = %self.group, error = %err, "receive failed");
            }
        }
    }
}

/// Restart policy that reconnects through the connector, waiting out the
/// reconnect backoff between attempts. A successful probe channel is handed
/// to the first restarted worker.
struct ReconnectProbe {
    source: Arc<ChannelSource>,
    backoff: Mutex<ReconnectBackoff>,
    shutdown: CancellationToken,
}

#[async_trait]
impl RestartPolicy for ReconnectProbe {
    async fn try_restart(&self) -> bool {
        let (delay, attempt) = {
            let mut backoff = self.backoff.lock();
            let attempt = backoff.attempts();
            (backoff.next_delay(), attempt)
        };
        tokio::select! {
            () = self.shutdown.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        match self.source.connect().await {
            Ok(channel) => {
                self.backoff.lock().reset();
                self.source.established.lock().push(channel);
                info!(group = %self.source.config.group_name, attempt, "connection reestablished");
                true
            }
            Err(err) => {
                debug!(
                    group = %self.source.config.group_name,
                    attempt,
                    error = %err,
                    "reconnect attempt failed"
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelGroup
// ---------------------------------------------------------------------------

/// Lifecycle owner of one configured channel group.
pub struct ChannelGroup {
    source: Arc<ChannelSource>,
    config: Arc<ChannelGroupConfig>,
    router: Option<Arc<dyn PublishRouter>>,
    failures: Arc<FailureTracker>,
    flags: Mutex<Flags>,
    init_lock: tokio::sync::Mutex<()>,
    /// Held for the whole of a synchronous dispatch on the cached channel.
    dispatch_gate: tokio::sync::Mutex<()>,
    dispatch_channel: Mutex<Option<Arc<dyn MessagingChannel>>>,
    workers: WorkerGroup<WorkerChannel>,
    shutdown: CancellationToken,
}

impl ChannelGroup {
    /// Creates an uninitialized group.
    ///
    /// # Errors
    ///
    /// `BusError::Config` if `config` fails validation.
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        config: ChannelGroupConfig,
        stack: ChannelStack,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let workers = WorkerGroup::new(config.min_workers, config.max_workers)?;
        let config = Arc::new(config);
        Ok(Self {
            source: Arc::new(ChannelSource {
                connector,
                config: Arc::clone(&config),
                stack,
                established: Mutex::new(Vec::new()),
                live: DashMap::new(),
                next_id: AtomicUsize::new(0),
            }),
            config,
            router: None,
            failures: Arc::new(FailureTracker::new()),
            flags: Mutex::new(Flags::default()),
            init_lock: tokio::sync::Mutex::new(()),
            dispatch_gate: tokio::sync::Mutex::new(()),
            dispatch_channel: Mutex::new(None),
            workers,
            shutdown: CancellationToken::new(),
        })
    }

    /// Router that `publish` calls made from this group's deliveries use.
    #[must_use]
    pub fn with_publish_router(mut self, router: Arc<dyn PublishRouter>) -> Self {
        self.router = Some(router);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.group_name
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ChannelGroupConfig> {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> GroupState {
        self.flags.lock().state()
    }

    /// Receive loops of the current epoch that are still running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.active_workers()
    }

    #[must_use]
    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    /// Verifies connectivity and prepares the group. Idempotent.
    ///
    /// A failed probe is retried once; the group counts as initialized either
    /// way, so a transport that is down at startup does not fail the host.
    ///
    /// # Errors
    ///
    /// `BusError::Disposed` after disposal, or any non-connection error the
    /// connector reports (an unknown group, for instance).
    pub async fn initialize(&self) -> Result<(), BusError> {
        let _serialized = self.init_lock.lock().await;
        {
            let flags = self.flags.lock();
            if flags.disposed {
                return Err(BusError::Disposed("channel group"));
            }
            if flags.initialized {
                return Ok(());
            }
        }

        let probe = match self.source.connect().await {
            Ok(channel) => Some(channel),
            Err(err) if err.is_connection() => {
                warn!(group = %self.name(), error = %err, "probe connection failed; retrying once");
                match self.source.connect().await {
                    Ok(channel) => Some(channel),
                    Err(err) if err.is_connection() => {
                        warn!(group = %self.name(), error = %err, "transport unreachable; initializing without a connection");
                        None
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        if !self.config.dispatch_only {
            self.workers.initialize(
                WorkerChannelFactory {
                    source: Arc::clone(&self.source),
                },
                ReconnectProbe {
                    source: Arc::clone(&self.source),
                    backoff: Mutex::new(ReconnectBackoff::new()),
                    shutdown: self.shutdown.clone(),
                },
            )?;
        }

        let mut flags = self.flags.lock();
        if flags.disposed {
            if let Some(channel) = probe {
                channel.dispose();
            }
            return Err(BusError::Disposed("channel group"));
        }
        if let Some(channel) = probe {
            if !self.config.dispatch_only {
                self.source.established.lock().push(channel);
            } else if self.config.synchronous {
                *self.dispatch_channel.lock() = Some(channel);
            } else {
                channel.dispose();
            }
        }
        flags.initialized = true;
        info!(group = %self.name(), dispatch_only = self.config.dispatch_only, "channel group initialized");
        Ok(())
    }

    /// Sends `envelope` and hands the transaction it was enlisted in to
    /// `on_completed`, which decides whether it commits.
    ///
    /// Synchronous groups reuse one channel, one call at a time; other groups
    /// open a channel per call and release it once `on_completed` returns. A
    /// transaction `on_completed` leaves unresolved is rolled back.
    ///
    /// # Errors
    ///
    /// `BusError::Disposed`, `BusError::InvalidOperation` when uninitialized
    /// or not dispatch-only, `BusError::Connection` when the transport is
    /// unreachable, or whatever `on_completed` returns.
    pub async fn begin_dispatch<F, Fut>(
        &self,
        envelope: &ChannelEnvelope,
        on_completed: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(Arc<dyn ChannelTransaction>) -> Fut + Send,
        Fut: Future<Output = Result<(), BusError>> + Send,
    {
        {
            let mut flags = self.flags.lock();
            flags.ensure_ready()?;
            if !self.config.dispatch_only {
                return Err(BusError::InvalidOperation(
                    "full-duplex groups dispatch through their receiving channels",
                ));
            }
            flags.dispatching = true;
        }

        if self.config.synchronous {
            let _exclusive = self.dispatch_gate.lock().await;
            let channel = self.dispatch_channel().await?;
            if let Err(err) = channel.send(envelope).await {
                if err.is_connection() {
                    self.discard_dispatch_channel(&channel);
                }
                return Err(err);
            }
            return self.complete(&channel, on_completed).await;
        }

        let channel = self.source.connect().await?;
        let outcome = match channel.send(envelope).await {
            Ok(()) => self.complete(&channel, on_completed).await,
            Err(err) => Err(err),
        };
        channel.dispose();
        outcome
    }

    async fn complete<F, Fut>(
        &self,
        channel: &Arc<dyn MessagingChannel>,
        on_completed: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(Arc<dyn ChannelTransaction>) -> Fut + Send,
        Fut: Future<Output = Result<(), BusError>> + Send,
    {
        let transaction = channel.current_transaction();
        let outcome = on_completed(Arc::clone(&transaction)).await;
        if !transaction.is_finished() {
            debug!(group = %self.name(), "dispatch transaction left open; rolling back");
            if let Err(err) = transaction.rollback().await {
                warn!(group = %self.name(), error = %err, "failed to roll back dispatch");
            }
        }
        outcome
    }

    async fn dispatch_channel(&self) -> Result<Arc<dyn MessagingChannel>, BusError> {
        let cached = self.dispatch_channel.lock().clone();
        if let Some(channel) = cached {
            return Ok(channel);
        }
        let channel = self.source.connect().await?;
        let mut slot = self.dispatch_channel.lock();
        Ok(Arc::clone(slot.get_or_insert(channel)))
    }

    fn discard_dispatch_channel(&self, faulted: &Arc<dyn MessagingChannel>) {
        let mut slot = self.dispatch_channel.lock();
        if slot.as_ref().is_some_and(|cached| Arc::ptr_eq(cached, faulted)) {
            slot.take();
            faulted.dispose();
        }
    }

    /// Starts `min_workers` receive loops that hand each delivery to `handler`.
    ///
    /// Returns `Ok(false)` when the connections could not be established; the
    /// call may be retried later.
    ///
    /// # Errors
    ///
    /// `BusError::Disposed`, or `BusError::InvalidOperation` when
    /// uninitialized, dispatch-only or already receiving.
    pub async fn begin_receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<bool, BusError> {
        {
            let mut flags = self.flags.lock();
            flags.ensure_ready()?;
            if self.config.dispatch_only {
                return Err(BusError::InvalidOperation("dispatch-only groups cannot receive"));
            }
            if flags.receiving {
                return Err(BusError::InvalidOperation("channel group already receiving"));
            }
            flags.receiving = true;
        }

        match self.establish().await {
            Ok(true) => {}
            Ok(false) => {
                self.flags.lock().receiving = false;
                return Ok(false);
            }
            Err(err) => {
                self.flags.lock().receiving = false;
                return Err(err);
            }
        }

        let guard = DeliveryGuard::new(
            handler,
            Arc::clone(&self.failures),
            Arc::clone(&self.config),
            self.router.clone(),
        );
        let activity = ReceiveActivity {
            handler: Arc::new(guard),
            restart: self.workers.restart_handle(),
            idle: Duration::from_millis(self.config.receive_timeout_ms),
            group: self.config.group_name.clone(),
        };
        if let Err(err) = self.workers.start_activity(activity) {
            self.flags.lock().receiving = false;
            self.source.discard_established();
            return Err(err);
        }

        info!(group = %self.name(), workers = self.config.min_workers, "receiving");
        Ok(true)
    }

    /// Connects until `min_workers` channels are waiting for workers.
    async fn establish(&self) -> Result<bool, BusError> {
        loop {
            if self.source.established.lock().len() >= self.config.min_workers {
                return Ok(true);
            }
            match self.source.connect().await {
                Ok(channel) => self.source.established.lock().push(channel),
                Err(err) if err.is_connection() => {
                    warn!(group = %self.name(), error = %err, "could not establish receive channels");
                    self.source.discard_established();
                    return Ok(false);
                }
                Err(err) => {
                    self.source.discard_established();
                    return Err(err);
                }
            }
        }
    }

    /// Stops the workers and releases every channel the group opened. The
    /// connector is shared and left alone. Idempotent.
    pub fn dispose(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.disposed {
                return;
            }
            flags.disposed = true;
        }

        self.shutdown.cancel();
        self.workers.dispose();
        self.source.begin_shutdown();
        self.source.discard_established();
        if let Some(channel) = self.dispatch_channel.lock().take() {
            channel.dispose();
        }
        info!(group = %self.name(), "channel group disposed");
    }

    /// Disposes the group and waits for its receive loops to exit.
    pub async fn shutdown(&self) {
        self.dispose();
        self.workers.shutdown().await;
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("name", &self.config.group_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
