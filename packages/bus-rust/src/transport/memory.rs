//! In-process transport: named FIFO queues shared through a [`MemoryBroker`].
//!
//! Used by tests and by applications that want the full channel group
//! machinery without a broker process. Transaction modes behave as follows:
//!
//! - `None`: a received message is gone once popped; sends publish immediately.
//! - `Acknowledge`: a received message is requeued at the front if the
//!   delivery's transaction rolls back; sends publish immediately.
//! - `Full`: as `Acknowledge`, and sends are held until the transaction commits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use courier_core::{
    headers, Address, ChannelEnvelope, ChannelGroupConfig, ChannelMessage, TransactionMode,
};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{
    ChannelConnector, ChannelTransaction, ConnectionState, Delivery, DeliveryHandler,
    DependencyResolver, LocalTransaction, MessagingChannel,
};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Arc<ChannelMessage>>>,
    notify: Notify,
}

/// Shared set of named queues. Starts online.
pub struct MemoryBroker {
    online: AtomicBool,
    queues: DashMap<String, Arc<MemoryQueue>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            queues: DashMap::new(),
        })
    }

    /// Takes the broker on or offline. Going offline fails pending receives.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was && !online {
            for queue in self.queues.iter() {
                queue.value().notify.notify_waiters();
            }
        }
        debug!(online, "memory broker state changed");
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        if let Some(queue) = self.queues.get(name) {
            return Arc::clone(queue.value());
        }
        Arc::clone(self.queues.entry(name.to_string()).or_default().value())
    }

    fn ensure_online(&self) -> Result<(), BusError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BusError::Connection("memory broker is offline".into()))
        }
    }

    /// Appends `message` to the queue named by `address`.
    ///
    /// # Errors
    ///
    /// `BusError::Connection` while the broker is offline.
    pub fn publish(&self, address: &Address, message: Arc<ChannelMessage>) -> Result<(), BusError> {
        self.publish_to(address.as_str(), message)
    }

    fn publish_to(&self, queue_name: &str, message: Arc<ChannelMessage>) -> Result<(), BusError> {
        self.ensure_online()?;
        let queue = self.queue(queue_name);
        queue.messages.lock().push_back(message);
        queue.notify.notify_one();
        counter!("courier_memory_published_total", "queue" => queue_name.to_string()).increment(1);
        trace!(queue = queue_name, "message published");
        Ok(())
    }

    /// Puts `message` back at the head of `queue_name`.
    pub fn requeue(&self, queue_name: &str, message: Arc<ChannelMessage>) {
        let queue = self.queue(queue_name);
        queue.messages.lock().push_front(message);
        queue.notify.notify_one();
        trace!(queue = queue_name, "message requeued");
    }

    /// Pops the head of `queue_name`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout or when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// `BusError::Connection` if the broker is or goes offline.
    pub async fn pop(
        &self,
        queue_name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Option<Arc<ChannelMessage>>, BusError> {
        let queue = self.queue(queue_name);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_online()?;
            if let Some(message) = queue.messages.lock().pop_front() {
                return Ok(Some(message));
            }

            tokio::select! {
                () = notified.as_mut() => {}
                () = tokio::time::sleep_until(deadline) => return Ok(None),
                () = shutdown.cancelled() => return Ok(None),
            }
        }
    }

    #[must_use]
    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map_or(0, |queue| queue.messages.lock().len())
    }

    /// Removes and returns everything queued under `queue_name`.
    #[must_use]
    pub fn drain(&self, queue_name: &str) -> Vec<Arc<ChannelMessage>> {
        self.queues
            .get(queue_name)
            .map(|queue| queue.messages.lock().drain(..).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("online", &self.is_online())
            .field("queues", &self.queues.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    groups: Vec<Arc<ChannelGroupConfig>>,
    attempts: AtomicUsize,
    disposed: AtomicBool,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(
        broker: Arc<MemoryBroker>,
        groups: impl IntoIterator<Item = ChannelGroupConfig>,
    ) -> Self {
        Self {
            broker,
            groups: groups.into_iter().map(Arc::new).collect(),
            attempts: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Number of `connect` calls made so far, successful or not.
    #[must_use]
    pub fn connection_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self, group_name: &str) -> Result<Arc<dyn MessagingChannel>, BusError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed("connector"));
        }
        let config = self
            .groups
            .iter()
            .find(|group| group.group_name == group_name)
            .cloned()
            .ok_or_else(|| {
                BusError::invalid_argument("group_name", format!("unknown channel group `{group_name}`"))
            })?;
        self.broker.ensure_online()?;

        debug!(group = group_name, "memory channel opened");
        Ok(MemoryChannel::new(Arc::clone(&self.broker), config))
    }

    fn current_state(&self) -> ConnectionState {
        if self.disposed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else if self.broker.is_online() {
            ConnectionState::Open
        } else {
            ConnectionState::Unreachable
        }
    }

    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfig>> {
        self.groups.clone()
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    config: Arc<ChannelGroupConfig>,
    transaction: Mutex<Arc<LocalTransaction>>,
    current: Mutex<Option<Arc<ChannelMessage>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    this: Weak<MemoryChannel>,
}

impl MemoryChannel {
    #[must_use]
    pub fn new(broker: Arc<MemoryBroker>, config: Arc<ChannelGroupConfig>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            broker,
            config,
            transaction: Mutex::new(Arc::new(LocalTransaction::new())),
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    fn ensure_live(&self) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(BusError::Disposed("channel"))
        } else {
            Ok(())
        }
    }

    /// The active transaction, replaced by a fresh one once finished.
    fn active_transaction(&self) -> Arc<LocalTransaction> {
        let mut slot = self.transaction.lock();
        if slot.is_finished() {
            *slot = Arc::new(LocalTransaction::new());
        }
        Arc::clone(&slot)
    }

    fn queue_name<'a>(&'a self, recipient: &'a Address) -> &'a str {
        if recipient.as_str() == Address::LOOPBACK {
            self.config.input_queue()
        } else {
            recipient.as_str()
        }
    }

    /// The message as it travels: stamped with its dispatch time unless an
    /// earlier hop already did so.
    fn outbound(message: &ChannelMessage) -> Arc<ChannelMessage> {
        if message.headers().contains_key(headers::AUDIT_DISPATCHED) {
            return Arc::new(message.clone());
        }
        let mut stamped = message.clone();
        let dispatched = stamped.dispatched().to_rfc3339_opts(SecondsFormat::Millis, true);
        stamped
            .headers_mut()
            .insert(headers::AUDIT_DISPATCHED.to_string(), dispatched);
        Arc::new(stamped)
    }

    fn resolve_unfinished(&self, transaction: &LocalTransaction) {
        if transaction.is_finished() {
            return;
        }
        let outcome = match self.config.transaction_mode {
            TransactionMode::None => transaction.commit_now(),
            TransactionMode::Acknowledge | TransactionMode::Full => transaction.rollback_now(),
        };
        if let Err(err) = outcome {
            warn!(error = %err, "failed to resolve delivery transaction");
        }
    }
}

#[async_trait]
impl MessagingChannel for MemoryChannel {
    async fn send(&self, envelope: &ChannelEnvelope) -> Result<(), BusError> {
        self.ensure_live()?;
        self.broker.ensure_online()?;

        let message = Self::outbound(envelope.message());
        let queues: Vec<String> = envelope
            .recipients()
            .iter()
            .map(|recipient| self.queue_name(recipient).to_string())
            .collect();

        if self.config.transaction_mode == TransactionMode::Full {
            let broker = Arc::clone(&self.broker);
            return self.active_transaction().enlist(Box::new(move || {
                for queue in &queues {
                    if let Err(err) = broker.publish_to(queue, Arc::clone(&message)) {
                        warn!(queue = %queue, error = %err, "dropping committed send");
                    }
                }
            }));
        }

        for queue in &queues {
            self.broker.publish_to(queue, Arc::clone(&message))?;
        }
        Ok(())
    }

    async fn receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), BusError> {
        self.ensure_live()?;
        let queue = self.config.input_queue().to_string();
        let timeout = Duration::from_millis(self.config.receive_timeout_ms);

        let Some(message) = self.broker.pop(&queue, timeout, &self.shutdown).await? else {
            return Ok(());
        };
        if message.is_expired(Utc::now()) {
            debug!(message_id = %message.message_id(), queue = %queue, "discarding expired message");
            return Ok(());
        }
        let channel: Arc<dyn MessagingChannel> = match self.this.upgrade() {
            Some(channel) => channel,
            None => {
                self.broker.requeue(&queue, message);
                return Err(BusError::Disposed("channel"));
            }
        };

        let transaction = Arc::new(LocalTransaction::new());
        if self.config.transaction_mode != TransactionMode::None {
            let broker = Arc::clone(&self.broker);
            let requeued = Arc::clone(&message);
            let queue = queue.clone();
            transaction.on_rollback(Box::new(move || broker.requeue(&queue, requeued)))?;
        }
        *self.transaction.lock() = Arc::clone(&transaction);
        *self.current.lock() = Some(Arc::clone(&message));

        let mut delivery = Delivery::new(
            message,
            Arc::clone(&transaction) as Arc<dyn ChannelTransaction>,
            Arc::clone(&self.config),
            channel,
        );
        let outcome = handler.handle(&mut delivery).await;

        self.resolve_unfinished(&transaction);
        *self.current.lock() = None;
        outcome
    }

    fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn current_message(&self) -> Option<Arc<ChannelMessage>> {
        self.current.lock().clone()
    }

    fn current_transaction(&self) -> Arc<dyn ChannelTransaction> {
        self.active_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfig> {
        Arc::clone(&self.config)
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        None
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        debug!(group = %self.config.group_name, "memory channel disposed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration as ChronoDuration;
    use courier_core::Payload;
    use uuid::Uuid;

    use super::*;

    fn addr(value: &str) -> Address {
        Address::parse(value).unwrap()
    }

    fn message() -> Arc<ChannelMessage> {
        Arc::new(ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BTreeMap::new(),
            vec![Payload::new("hello")],
        ))
    }

    fn config(name: &str, mode: TransactionMode) -> ChannelGroupConfig {
        let mut config = ChannelGroupConfig::named(name);
        config.transaction_mode = mode;
        config.receive_timeout_ms = 20;
        config
    }

    async fn channel(broker: &Arc<MemoryBroker>, config: ChannelGroupConfig) -> Arc<dyn MessagingChannel> {
        let name = config.group_name.clone();
        MemoryConnector::new(Arc::clone(broker), [config])
            .connect(&name)
            .await
            .unwrap()
    }

    struct Outcome {
        commit: Option<bool>,
        fail: bool,
        seen: Mutex<Vec<Uuid>>,
    }

    impl Outcome {
        fn new(commit: Option<bool>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                commit,
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeliveryHandler for Outcome {
        async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
            self.seen.lock().push(delivery.message().message_id());
            match self.commit {
                Some(true) => delivery.transaction().commit().await?,
                Some(false) => delivery.transaction().rollback().await?,
                None => {}
            }
            if self.fail {
                return Err(BusError::Handler(anyhow::anyhow!("rejected")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        let popped = broker.pop("idle", Duration::from_millis(10), &token).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        let waiter = {
            let broker = Arc::clone(&broker);
            let token = token.clone();
            tokio::spawn(async move { broker.pop("work", Duration::from_secs(5), &token).await })
        };
        tokio::task::yield_now().await;
        broker.publish(&addr("work"), message()).unwrap();

        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn going_offline_fails_waiters_and_publishes() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        let waiter = {
            let broker = Arc::clone(&broker);
            let token = token.clone();
            tokio::spawn(async move { broker.pop("work", Duration::from_secs(5), &token).await })
        };
        tokio::task::yield_now().await;
        broker.set_online(false);

        assert!(waiter.await.unwrap().unwrap_err().is_connection());
        assert!(broker.publish(&addr("work"), message()).unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn connector_reports_state_and_counts_attempts() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(Arc::clone(&broker), [ChannelGroupConfig::named("a")]);

        assert_eq!(connector.current_state(), ConnectionState::Open);
        assert!(matches!(
            connector.connect("missing").await,
            Err(BusError::InvalidArgument { name: "group_name", .. })
        ));

        broker.set_online(false);
        assert_eq!(connector.current_state(), ConnectionState::Unreachable);
        assert!(connector.connect("a").await.err().unwrap().is_connection());

        connector.dispose();
        assert_eq!(connector.current_state(), ConnectionState::Closed);
        assert_eq!(connector.connection_attempts(), 2);
        assert_eq!(connector.channel_groups().len(), 1);
    }

    #[tokio::test]
    async fn loopback_targets_own_input_queue() {
        let broker = MemoryBroker::new();
        let mut config = config("orders", TransactionMode::None);
        config.input_queue = Some("orders.in".into());
        let channel = channel(&broker, config).await;

        let envelope = ChannelEnvelope::new(message(), [Address::loopback()]).unwrap();
        channel.send(&envelope).await.unwrap();

        assert_eq!(broker.queue_len("orders.in"), 1);
        let sent = broker.drain("orders.in");
        assert!(sent[0].headers().contains_key(headers::AUDIT_DISPATCHED));
    }

    #[tokio::test]
    async fn rollback_requeues_under_acknowledge() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, config("work", TransactionMode::Acknowledge)).await;
        let sent = message();
        broker.publish(&addr("work"), Arc::clone(&sent)).unwrap();

        let handler = Outcome::new(Some(false), false);
        channel.receive(handler.clone()).await.unwrap();
        assert_eq!(broker.queue_len("work"), 1);

        let handler = Outcome::new(Some(true), false);
        channel.receive(handler.clone()).await.unwrap();
        assert_eq!(*handler.seen.lock(), vec![sent.message_id()]);
        assert_eq!(broker.queue_len("work"), 0);
    }

    #[tokio::test]
    async fn unresolved_deliveries_follow_the_transaction_mode() {
        let broker = MemoryBroker::new();

        let acked = channel(&broker, config("acked", TransactionMode::Acknowledge)).await;
        broker.publish(&addr("acked"), message()).unwrap();
        let err = acked.receive(Outcome::new(None, true)).await.unwrap_err();
        assert!(matches!(err, BusError::Handler(_)));
        assert_eq!(broker.queue_len("acked"), 1);

        let fire_and_forget = channel(&broker, config("plain", TransactionMode::None)).await;
        broker.publish(&addr("plain"), message()).unwrap();
        fire_and_forget.receive(Outcome::new(None, true)).await.unwrap_err();
        assert_eq!(broker.queue_len("plain"), 0);
    }

    #[tokio::test]
    async fn full_mode_holds_sends_until_commit() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, config("outbound", TransactionMode::Full)).await;
        let envelope = ChannelEnvelope::new(message(), [addr("a"), addr("b")]).unwrap();

        channel.send(&envelope).await.unwrap();
        assert_eq!(broker.queue_len("a"), 0);

        let transaction = channel.current_transaction();
        transaction.commit().await.unwrap();
        assert_eq!(broker.queue_len("a"), 1);
        assert_eq!(broker.queue_len("b"), 1);
        assert!(!channel.current_transaction().is_finished());
    }

    #[tokio::test]
    async fn expired_messages_are_skipped() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, config("work", TransactionMode::None)).await;
        let expired = ChannelMessage::new(Uuid::new_v4(), Uuid::new_v4(), None, BTreeMap::new(), vec![])
            .with_expiration(Utc::now() - ChronoDuration::seconds(1));
        broker.publish(&addr("work"), Arc::new(expired)).unwrap();

        let handler = Outcome::new(Some(true), false);
        channel.receive(handler.clone()).await.unwrap();
        assert!(handler.seen.lock().is_empty());
        assert_eq!(broker.queue_len("work"), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_a_pending_receive() {
        let broker = MemoryBroker::new();
        let mut config = config("work", TransactionMode::None);
        config.receive_timeout_ms = 60_000;
        let channel = channel(&broker, config).await;

        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive(Outcome::new(None, false)).await })
        };
        tokio::task::yield_now().await;
        channel.begin_shutdown();
        pending.await.unwrap().unwrap();

        channel.dispose();
        channel.dispose();
        assert!(matches!(
            channel.receive(Outcome::new(None, false)).await,
            Err(BusError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn current_message_is_set_only_during_delivery() {
        struct Peek(Mutex<Option<Uuid>>);

        #[async_trait]
        impl DeliveryHandler for Peek {
            async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
                *self.0.lock() = delivery
                    .channel()
                    .current_message()
                    .map(|message| message.message_id());
                Ok(())
            }
        }

        let broker = MemoryBroker::new();
        let channel = channel(&broker, config("work", TransactionMode::None)).await;
        let sent = message();
        broker.publish(&addr("work"), Arc::clone(&sent)).unwrap();

        let peek = Arc::new(Peek(Mutex::new(None)));
        channel.receive(peek.clone()).await.unwrap();
        assert_eq!(*peek.0.lock(), Some(sent.message_id()));
        assert!(channel.current_message().is_none());
    }
}
