//! Per-delivery dependency scopes.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{ChannelEnvelope, ChannelGroupConfig, ChannelMessage};
use parking_lot::RwLock;
use tower::Layer;
use tracing::trace;

use super::delivery::Delivery;
use super::traits::{ChannelTransaction, DeliveryHandler, DependencyResolver, MessagingChannel};
use crate::error::BusError;

/// Wraps a channel in a [`ResolverChannel`] when a root resolver is configured.
#[derive(Clone, Default)]
pub struct ResolverLayer {
    resolver: Option<Arc<dyn DependencyResolver>>,
}

impl ResolverLayer {
    #[must_use]
    pub fn new(resolver: Option<Arc<dyn DependencyResolver>>) -> Self {
        Self { resolver }
    }
}

impl Layer<Arc<dyn MessagingChannel>> for ResolverLayer {
    type Service = Arc<dyn MessagingChannel>;

    fn layer(&self, inner: Arc<dyn MessagingChannel>) -> Self::Service {
        match &self.resolver {
            Some(resolver) => ResolverChannel::new(inner, Arc::clone(resolver)),
            None => inner,
        }
    }
}

/// Opens a nested resolver scope for every delivery and releases it when the
/// delivery ends, whatever the outcome.
pub struct ResolverChannel {
    inner: Arc<dyn MessagingChannel>,
    root: Arc<dyn DependencyResolver>,
    scope: RwLock<Option<Arc<dyn DependencyResolver>>>,
    this: Weak<ResolverChannel>,
}

impl ResolverChannel {
    #[must_use]
    pub fn new(inner: Arc<dyn MessagingChannel>, root: Arc<dyn DependencyResolver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            root,
            scope: RwLock::new(None),
            this: this.clone(),
        })
    }
}

/// Clears and releases the active scope on drop.
struct ScopeGuard {
    channel: Arc<ResolverChannel>,
    scope: Arc<dyn DependencyResolver>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.channel.scope.write().take();
        self.scope.release();
        trace!("delivery scope released");
    }
}

struct ScopedHandler {
    channel: Weak<ResolverChannel>,
    inner: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for ScopedHandler {
    async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
        let Some(channel) = self.channel.upgrade() else {
            return Err(BusError::Disposed("channel"));
        };

        let scope = channel.root.create_nested();
        *channel.scope.write() = Some(Arc::clone(&scope));
        let _guard = ScopeGuard {
            channel: Arc::clone(&channel),
            scope: Arc::clone(&scope),
        };

        delivery.set_channel(channel);
        delivery.set_resolver(Some(scope));
        self.inner.handle(delivery).await
    }
}

#[async_trait]
impl MessagingChannel for ResolverChannel {
    async fn send(&self, envelope: &ChannelEnvelope) -> Result<(), BusError> {
        self.inner.send(envelope).await
    }

    async fn receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), BusError> {
        let scoped = Arc::new(ScopedHandler {
            channel: self.this.clone(),
            inner: handler,
        });
        self.inner.receive(scoped).await
    }

    fn begin_shutdown(&self) {
        self.inner.begin_shutdown();
    }

    fn current_message(&self) -> Option<Arc<ChannelMessage>> {
        self.inner.current_message()
    }

    fn current_transaction(&self) -> Arc<dyn ChannelTransaction> {
        self.inner.current_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfig> {
        self.inner.current_configuration()
    }

    /// The active delivery scope, or the root resolver between deliveries.
    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        Some(
            self.scope
                .read()
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.root)),
        )
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::any::{Any, TypeId};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::{Address, Payload};
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::transport::memory::{MemoryBroker, MemoryConnector};
    use crate::ChannelConnector;

    struct RequestId(usize);

    #[derive(Default)]
    struct CountingResolver {
        depth: usize,
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl DependencyResolver for CountingResolver {
        fn get(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
            (type_id == TypeId::of::<RequestId>() && self.depth > 0).then(|| {
                Arc::new(RequestId(self.opened.load(Ordering::SeqCst))) as Arc<dyn Any + Send + Sync>
            })
        }

        fn create_nested(&self) -> Arc<dyn DependencyResolver> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingResolver {
                depth: self.depth + 1,
                opened: Arc::clone(&self.opened),
                released: Arc::clone(&self.released),
            })
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScopeProbe {
        fail: bool,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl DeliveryHandler for ScopeProbe {
        async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
            let scoped = delivery.resolver().cloned().unwrap();
            let request = scoped.resolve::<RequestId>().unwrap();
            self.seen.lock().push(request.0);
            assert!(delivery.channel().current_resolver().is_some());
            if self.fail {
                return Err(BusError::Handler(anyhow::anyhow!("scoped failure")));
            }
            Ok(())
        }
    }

    async fn resolver_channel(
        broker: &Arc<MemoryBroker>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Arc<dyn MessagingChannel> {
        let inner = MemoryConnector::new(Arc::clone(broker), [ChannelGroupConfig::named("scoped")])
            .connect("scoped")
            .await
            .unwrap();
        ResolverLayer::new(Some(resolver)).layer(inner)
    }

    fn enqueue(broker: &MemoryBroker) {
        let message = ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BTreeMap::new(),
            vec![Payload::new(1_u8)],
        );
        broker
            .publish(&Address::parse("scoped").unwrap(), Arc::new(message))
            .unwrap();
    }

    #[tokio::test]
    async fn every_delivery_gets_its_own_scope() {
        let broker = MemoryBroker::new();
        let root = CountingResolver::default();
        let (opened, released) = (Arc::clone(&root.opened), Arc::clone(&root.released));
        let channel = resolver_channel(&broker, Arc::new(root)).await;

        let probe = Arc::new(ScopeProbe {
            fail: false,
            seen: Mutex::new(Vec::new()),
        });
        enqueue(&broker);
        enqueue(&broker);
        channel.receive(probe.clone()).await.unwrap();
        channel.receive(probe.clone()).await.unwrap();

        assert_eq!(*probe.seen.lock(), vec![1, 2]);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scope_is_released_when_the_handler_fails() {
        let broker = MemoryBroker::new();
        let root = CountingResolver::default();
        let released = Arc::clone(&root.released);
        let channel = resolver_channel(&broker, Arc::new(root)).await;

        enqueue(&broker);
        let probe = Arc::new(ScopeProbe {
            fail: true,
            seen: Mutex::new(Vec::new()),
        });
        assert!(channel.receive(probe).await.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let between = channel.current_resolver().unwrap();
        assert!(between.resolve::<RequestId>().is_none());
    }

    #[tokio::test]
    async fn layer_without_resolver_passes_through() {
        let broker = MemoryBroker::new();
        let inner = MemoryConnector::new(broker, [ChannelGroupConfig::named("plain")])
            .connect("plain")
            .await
            .unwrap();
        let layered = ResolverLayer::default().layer(Arc::clone(&inner));
        assert!(Arc::ptr_eq(&inner, &layered));
        assert!(layered.current_resolver().is_none());
    }
}
