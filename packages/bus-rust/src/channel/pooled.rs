//! Connection reuse for synchronous dispatch-only groups.
//!
//! The connector keeps one pool of physical channels per pooled group and
//! hands out a [`PooledDispatchChannel`] lease per `connect`. A lease borrows
//! a physical channel on its first send and holds it until the caller
//! resolves the transaction returned by `current_transaction`; commit and
//! rollback both return the channel to the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ChannelEnvelope, ChannelGroupConfig, ChannelMessage};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::traits::{
    ChannelConnector, ChannelTransaction, ConnectionState, DeliveryHandler, DependencyResolver,
    MessagingChannel, TransactionAction,
};
use super::transaction::LocalTransaction;
use crate::error::BusError;

type Lease = Arc<Mutex<Option<Arc<dyn MessagingChannel>>>>;

// ---------------------------------------------------------------------------
// PooledDispatchConnector
// ---------------------------------------------------------------------------

/// Connector decorator that pools physical channels of synchronous
/// dispatch-only groups. Channels of any other group pass through.
pub struct PooledDispatchConnector {
    inner: Arc<dyn ChannelConnector>,
    pools: DashMap<String, Arc<DispatchPool>>,
    disposed: AtomicBool,
}

impl PooledDispatchConnector {
    #[must_use]
    pub fn new(inner: Arc<dyn ChannelConnector>) -> Self {
        Self {
            inner,
            pools: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Physical channels idle in the pool of `group_name`.
    #[must_use]
    pub fn idle(&self, group_name: &str) -> usize {
        self.pools
            .get(group_name)
            .map_or(0, |pool| pool.value().idle.lock().len())
    }

    fn pooled_config(&self, group_name: &str) -> Option<Arc<ChannelGroupConfig>> {
        self.inner
            .channel_groups()
            .into_iter()
            .find(|config| config.group_name == group_name && config.is_pooled())
    }
}

#[async_trait]
impl ChannelConnector for PooledDispatchConnector {
    async fn connect(&self, group_name: &str) -> Result<Arc<dyn MessagingChannel>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed("connector"));
        }
        let Some(config) = self.pooled_config(group_name) else {
            return self.inner.connect(group_name).await;
        };

        let pool = Arc::clone(
            self.pools
                .entry(group_name.to_string())
                .or_insert_with(|| {
                    debug!(group = group_name, "pooling dispatch channels");
                    Arc::new(DispatchPool {
                        connector: Arc::clone(&self.inner),
                        config,
                        idle: Mutex::new(Vec::new()),
                        disposed: AtomicBool::new(false),
                    })
                })
                .value(),
        );
        pool.warm().await?;
        Ok(PooledDispatchChannel::new(pool) as Arc<dyn MessagingChannel>)
    }

    fn current_state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfig>> {
        self.inner.channel_groups()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for pool in self.pools.iter() {
            pool.value().dispose();
        }
        self.pools.clear();
        self.inner.dispose();
    }
}

// ---------------------------------------------------------------------------
// DispatchPool
// ---------------------------------------------------------------------------

struct DispatchPool {
    connector: Arc<dyn ChannelConnector>,
    config: Arc<ChannelGroupConfig>,
    idle: Mutex<Vec<Arc<dyn MessagingChannel>>>,
    disposed: AtomicBool,
}

impl DispatchPool {
    /// Makes sure one channel is ready, so an unreachable transport fails
    /// `connect` rather than the first send.
    async fn warm(&self) -> Result<(), BusError> {
        if !self.idle.lock().is_empty() {
            return Ok(());
        }
        let channel = self.connector.connect(&self.config.group_name).await?;
        self.release(channel);
        Ok(())
    }

    async fn borrow(&self) -> Result<Arc<dyn MessagingChannel>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed("channel pool"));
        }
        let idle = self.idle.lock().pop();
        match idle {
            Some(channel) => Ok(channel),
            None => self.connector.connect(&self.config.group_name).await,
        }
    }

    fn release(&self, channel: Arc<dyn MessagingChannel>) {
        if self.disposed.load(Ordering::Acquire) {
            channel.dispose();
            return;
        }
        self.idle.lock().push(channel);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = std::mem::take(&mut *self.idle.lock());
        for channel in idle {
            channel.dispose();
        }
    }
}

// ---------------------------------------------------------------------------
// PooledDispatchChannel
// ---------------------------------------------------------------------------

/// A lease on a group's dispatch pool.
///
/// Sends enlist in the borrowed physical channel's own transaction, so a
/// rollback by the caller discards them. Disposing the lease gives up a
/// channel whose transaction is still open; the pool itself stays with the
/// connector.
pub struct PooledDispatchChannel {
    pool: Arc<DispatchPool>,
    lease: Lease,
    /// Carries registrations made while no physical channel is borrowed.
    standby: Mutex<Arc<LocalTransaction>>,
    disposed: AtomicBool,
}

impl PooledDispatchChannel {
    fn new(pool: Arc<DispatchPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            lease: Arc::new(Mutex::new(None)),
            standby: Mutex::new(Arc::new(LocalTransaction::new())),
            disposed: AtomicBool::new(false),
        })
    }

    /// Whether a physical channel is borrowed for an unresolved transaction.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.lease.lock().is_some()
    }

    async fn leased(&self) -> Result<Arc<dyn MessagingChannel>, BusError> {
        let held = self.lease.lock().clone();
        if let Some(channel) = held {
            return Ok(channel);
        }
        let channel = self.pool.borrow().await?;
        *self.lease.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }
}

#[async_trait]
impl MessagingChannel for PooledDispatchChannel {
    async fn send(&self, envelope: &ChannelEnvelope) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed("channel"));
        }

        let physical = self.leased().await?;
        if let Err(err) = physical.send(envelope).await {
            if err.is_connection() {
                warn!(group = %self.pool.config.group_name, error = %err, "discarding faulted pooled channel");
                self.lease.lock().take();
                physical.dispose();
            }
            return Err(err);
        }
        Ok(())
    }

    async fn receive(&self, _handler: Arc<dyn DeliveryHandler>) -> Result<(), BusError> {
        Err(BusError::InvalidOperation(
            "pooled channels are dispatch-only",
        ))
    }

    fn begin_shutdown(&self) {
        if let Some(channel) = self.lease.lock().as_ref() {
            channel.begin_shutdown();
        }
    }

    fn current_message(&self) -> Option<Arc<ChannelMessage>> {
        None
    }

    fn current_transaction(&self) -> Arc<dyn ChannelTransaction> {
        let held = self.lease.lock().clone();
        if let Some(physical) = held {
            return Arc::new(LeasedTransaction {
                inner: physical.current_transaction(),
                physical,
                lease: Arc::clone(&self.lease),
                pool: Arc::clone(&self.pool),
            });
        }

        let mut slot = self.standby.lock();
        if slot.is_finished() {
            *slot = Arc::new(LocalTransaction::new());
        }
        Arc::clone(&slot) as Arc<dyn ChannelTransaction>
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfig> {
        Arc::clone(&self.pool.config)
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        None
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let held = self.lease.lock().take();
        if let Some(channel) = held {
            debug!(group = %self.pool.config.group_name, "lease disposed with an open transaction");
            channel.dispose();
        }
    }
}

// ---------------------------------------------------------------------------
// LeasedTransaction
// ---------------------------------------------------------------------------

/// The physical channel's transaction; resolving it ends the lease.
struct LeasedTransaction {
    inner: Arc<dyn ChannelTransaction>,
    physical: Arc<dyn MessagingChannel>,
    lease: Lease,
    pool: Arc<DispatchPool>,
}

impl LeasedTransaction {
    fn end_lease(&self, outcome: &Result<(), BusError>) {
        {
            let mut lease = self.lease.lock();
            if !lease
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, &self.physical))
            {
                return;
            }
            lease.take();
        }
        match outcome {
            Err(err) if err.is_connection() => self.physical.dispose(),
            _ => self.pool.release(Arc::clone(&self.physical)),
        }
    }
}

#[async_trait]
impl ChannelTransaction for LeasedTransaction {
    fn register(&self, action: TransactionAction) -> Result<(), BusError> {
        self.inner.register(action)
    }

    async fn commit(&self) -> Result<(), BusError> {
        let outcome = self.inner.commit().await;
        self.end_lease(&outcome);
        outcome
    }

    async fn rollback(&self) -> Result<(), BusError> {
        let outcome = self.inner.rollback().await;
        self.end_lease(&outcome);
        outcome
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use courier_core::{Address, Payload, TransactionMode};
    use uuid::Uuid;

    use super::*;
    use crate::channel::Delivery;
    use crate::transport::memory::{MemoryBroker, MemoryConnector};

    fn dispatch_group(name: &str, synchronous: bool) -> ChannelGroupConfig {
        let mut config = ChannelGroupConfig::named(name);
        config.dispatch_only = true;
        config.synchronous = synchronous;
        config
    }

    fn full(mut config: ChannelGroupConfig) -> ChannelGroupConfig {
        config.transaction_mode = TransactionMode::Full;
        config
    }

    fn envelope() -> ChannelEnvelope {
        let message = ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BTreeMap::new(),
            vec![Payload::new("ping")],
        );
        ChannelEnvelope::new(message, [Address::parse("sink").unwrap()]).unwrap()
    }

    fn connectors(
        groups: Vec<ChannelGroupConfig>,
    ) -> (Arc<MemoryBroker>, Arc<MemoryConnector>, PooledDispatchConnector) {
        let broker = MemoryBroker::new();
        let memory = Arc::new(MemoryConnector::new(Arc::clone(&broker), groups));
        let pooled = PooledDispatchConnector::new(Arc::clone(&memory) as Arc<dyn ChannelConnector>);
        (broker, memory, pooled)
    }

    #[tokio::test]
    async fn full_duplex_and_async_channels_pass_through() {
        let (_, memory, pooled) = connectors(vec![
            ChannelGroupConfig::named("duplex"),
            dispatch_group("async", false),
        ]);

        let first = pooled.connect("duplex").await.unwrap();
        let second = pooled.connect("duplex").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        pooled.connect("async").await.unwrap();
        assert_eq!(memory.connection_attempts(), 3);
        assert_eq!(pooled.idle("duplex"), 0);
    }

    #[tokio::test]
    async fn leases_reuse_one_physical_channel() {
        let (broker, memory, pooled) = connectors(vec![dispatch_group("outbound", true)]);

        let first = pooled.connect("outbound").await.unwrap();
        let second = pooled.connect("outbound").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        first.send(&envelope()).await.unwrap();
        first.current_transaction().commit().await.unwrap();
        second.send(&envelope()).await.unwrap();
        second.current_transaction().commit().await.unwrap();

        assert_eq!(memory.connection_attempts(), 1);
        assert_eq!(pooled.idle("outbound"), 1);
        assert_eq!(broker.queue_len("sink"), 2);
        assert!(matches!(
            first.receive(Arc::new(NoopHandler)).await,
            Err(BusError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn rollback_discards_the_send_and_returns_the_channel() {
        let (broker, memory, pooled) = connectors(vec![full(dispatch_group("outbound", true))]);
        let channel = pooled.connect("outbound").await.unwrap();

        channel.send(&envelope()).await.unwrap();
        assert_eq!(pooled.idle("outbound"), 0);
        channel.current_transaction().rollback().await.unwrap();
        assert_eq!(broker.queue_len("sink"), 0);
        assert_eq!(pooled.idle("outbound"), 1);

        channel.send(&envelope()).await.unwrap();
        channel.current_transaction().commit().await.unwrap();
        assert_eq!(broker.queue_len("sink"), 1);
        assert_eq!(memory.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn concurrent_leases_hold_separate_transactions() {
        let (broker, memory, pooled) = connectors(vec![full(dispatch_group("outbound", true))]);
        let committing = pooled.connect("outbound").await.unwrap();
        let rolling_back = pooled.connect("outbound").await.unwrap();

        committing.send(&envelope()).await.unwrap();
        rolling_back.send(&envelope()).await.unwrap();
        assert_eq!(memory.connection_attempts(), 2);

        committing.current_transaction().commit().await.unwrap();
        rolling_back.current_transaction().rollback().await.unwrap();
        assert_eq!(broker.queue_len("sink"), 1);
        assert_eq!(pooled.idle("outbound"), 2);
    }

    #[tokio::test]
    async fn faulted_channels_are_not_returned() {
        let (broker, memory, pooled) = connectors(vec![dispatch_group("outbound", true)]);
        let channel = pooled.connect("outbound").await.unwrap();

        broker.set_online(false);
        assert!(channel.send(&envelope()).await.unwrap_err().is_connection());
        assert_eq!(pooled.idle("outbound"), 0);

        broker.set_online(true);
        channel.send(&envelope()).await.unwrap();
        channel.current_transaction().commit().await.unwrap();
        assert_eq!(memory.connection_attempts(), 2);
        assert_eq!(broker.queue_len("sink"), 1);
    }

    #[tokio::test]
    async fn post_commit_actions_run_when_the_caller_commits() {
        let (_, _, pooled) = connectors(vec![dispatch_group("outbound", true)]);
        let channel = pooled.connect("outbound").await.unwrap();
        channel.send(&envelope()).await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let transaction = channel.current_transaction();
        transaction
            .register(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(!ran.load(Ordering::SeqCst));

        transaction.commit().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!channel.current_transaction().is_finished());
    }

    #[tokio::test]
    async fn disposing_a_lease_leaves_the_pool_usable() {
        let (broker, memory, pooled) = connectors(vec![dispatch_group("outbound", true)]);

        let first = pooled.connect("outbound").await.unwrap();
        first.send(&envelope()).await.unwrap();
        first.dispose();
        assert!(matches!(first.send(&envelope()).await, Err(BusError::Disposed(_))));
        assert_eq!(pooled.idle("outbound"), 0);

        let second = pooled.connect("outbound").await.unwrap();
        second.send(&envelope()).await.unwrap();
        second.current_transaction().commit().await.unwrap();
        assert_eq!(memory.connection_attempts(), 2);
        assert_eq!(broker.queue_len("sink"), 2);
    }

    #[tokio::test]
    async fn delegates_and_disposes_underlying_connector_once() {
        let (_, memory, pooled) = connectors(vec![dispatch_group("outbound", true)]);
        assert_eq!(pooled.current_state(), ConnectionState::Open);
        assert_eq!(pooled.channel_groups().len(), 1);

        let channel = pooled.connect("outbound").await.unwrap();
        pooled.dispose();
        pooled.dispose();

        assert_eq!(memory.current_state(), ConnectionState::Closed);
        assert!(matches!(channel.send(&envelope()).await, Err(BusError::Disposed(_))));
        assert!(matches!(pooled.connect("outbound").await, Err(BusError::Disposed(_))));
    }

    struct NoopHandler;

    #[async_trait]
    impl DeliveryHandler for NoopHandler {
        async fn handle(&self, _delivery: &mut Delivery) -> Result<(), BusError> {
            Ok(())
        }
    }
}
