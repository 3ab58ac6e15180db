//! Type-keyed handler routing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Payload;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::discovery::{DiscoverMessageTypes, MessageView, TypeKey};
use crate::channel::{Delivery, DependencyResolver};

// ---------------------------------------------------------------------------
// HandleMessage
// ---------------------------------------------------------------------------

/// Handles logical messages of type `M`, which may be a concrete message type
/// or a capability trait object such as `dyn Trackable`.
#[async_trait]
pub trait HandleMessage<M: ?Sized + Send + Sync>: Send + Sync + 'static {
    async fn handle(&self, message: &M, delivery: &Delivery) -> anyhow::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// Erased routes
// ---------------------------------------------------------------------------

#[async_trait]
trait ErasedHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(&self, view: &MessageView, delivery: &Delivery) -> anyhow::Result<()>;
}

struct ConcreteRoute<M: Send + Sync + 'static> {
    handler: Arc<dyn HandleMessage<M>>,
}

#[async_trait]
impl<M: Any + Send + Sync> ErasedHandler for ConcreteRoute<M> {
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn invoke(&self, view: &MessageView, delivery: &Delivery) -> anyhow::Result<()> {
        let message = view.concrete::<M>().ok_or_else(|| {
            anyhow::anyhow!("payload is not a {}", std::any::type_name::<M>())
        })?;
        self.handler.handle(message, delivery).await
    }
}

struct CapabilityRoute<C: ?Sized + Send + Sync + 'static> {
    handler: Arc<dyn HandleMessage<C>>,
}

#[async_trait]
impl<C: ?Sized + Send + Sync + 'static> ErasedHandler for CapabilityRoute<C> {
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn invoke(&self, view: &MessageView, delivery: &Delivery) -> anyhow::Result<()> {
        let capability = view.capability::<C>().ok_or_else(|| {
            anyhow::anyhow!("payload does not expose {}", std::any::type_name::<C>())
        })?;
        self.handler.handle(capability.as_ref(), delivery).await
    }
}

type Route = Arc<dyn Fn(&dyn DependencyResolver) -> Box<dyn ErasedHandler> + Send + Sync>;

// ---------------------------------------------------------------------------
// RoutedHandler
// ---------------------------------------------------------------------------

/// A handler materialised for one message, bound to the view it handles.
pub struct RoutedHandler {
    view: MessageView,
    handler: Box<dyn ErasedHandler>,
}

impl RoutedHandler {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// The key the handler was registered under.
    #[must_use]
    pub fn key(&self) -> TypeKey {
        self.view.key()
    }

    /// Downcasts the message and runs the handler.
    ///
    /// # Errors
    ///
    /// Whatever the handler returns.
    pub async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        trace!(
            message_type = self.view.key().name(),
            handler = self.name(),
            "routing logical message to handler"
        );
        self.handler.invoke(&self.view, delivery).await?;
        debug!(
            message_type = self.view.key().name(),
            handler = self.name(),
            "handler completed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RoutedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedHandler")
            .field("key", &self.view.key())
            .field("handler", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MessageHandlerTable
// ---------------------------------------------------------------------------

/// Registry mapping routing keys to ordered handler routes.
///
/// Routes accumulate in registration order and are never deduplicated. The
/// table is an ordinary value: construct one per bus (or per test) and share
/// it behind an `Arc`.
pub struct MessageHandlerTable {
    discoverer: Arc<dyn DiscoverMessageTypes>,
    routes: RwLock<HashMap<TypeId, Vec<Route>>>,
    unrouted: AtomicU64,
}

impl MessageHandlerTable {
    #[must_use]
    pub fn new(discoverer: Arc<dyn DiscoverMessageTypes>) -> Self {
        Self {
            discoverer,
            routes: RwLock::new(HashMap::new()),
            unrouted: AtomicU64::new(0),
        }
    }

    /// Routes `M` to a single shared handler instance.
    pub fn register_handler<M, H>(&self, handler: H)
    where
        M: Any + Send + Sync,
        H: HandleMessage<M>,
    {
        let shared: Arc<dyn HandleMessage<M>> = Arc::new(handler);
        self.insert::<M>(Arc::new(move |_: &dyn DependencyResolver| {
            Box::new(ConcreteRoute {
                handler: Arc::clone(&shared),
            }) as Box<dyn ErasedHandler>
        }));
    }

    /// Routes `M` to a handler built per message from the delivery's resolver.
    pub fn register_factory<M, H, F>(&self, factory: F)
    where
        M: Any + Send + Sync,
        H: HandleMessage<M>,
        F: Fn(&dyn DependencyResolver) -> H + Send + Sync + 'static,
    {
        self.insert::<M>(Arc::new(move |resolver: &dyn DependencyResolver| {
            Box::new(ConcreteRoute::<M> {
                handler: Arc::new(factory(resolver)),
            }) as Box<dyn ErasedHandler>
        }));
    }

    /// Routes capability `C` (e.g. `dyn Trackable`) to a shared handler.
    pub fn register_capability_handler<C, H>(&self, handler: H)
    where
        C: ?Sized + Send + Sync + 'static,
        H: HandleMessage<C>,
    {
        let shared: Arc<dyn HandleMessage<C>> = Arc::new(handler);
        self.insert::<C>(Arc::new(move |_: &dyn DependencyResolver| {
            Box::new(CapabilityRoute {
                handler: Arc::clone(&shared),
            }) as Box<dyn ErasedHandler>
        }));
    }

    /// Routes capability `C` to a handler built per message.
    pub fn register_capability_factory<C, H, F>(&self, factory: F)
    where
        C: ?Sized + Send + Sync + 'static,
        H: HandleMessage<C>,
        F: Fn(&dyn DependencyResolver) -> H + Send + Sync + 'static,
    {
        self.insert::<C>(Arc::new(move |resolver: &dyn DependencyResolver| {
            Box::new(CapabilityRoute::<C> {
                handler: Arc::new(factory(resolver)),
            }) as Box<dyn ErasedHandler>
        }));
    }

    fn insert<K: ?Sized + 'static>(&self, route: Route) {
        debug!(message_type = std::any::type_name::<K>(), "registering handler");
        self.routes
            .write()
            .entry(TypeId::of::<K>())
            .or_default()
            .push(route);
    }

    /// Materialises every handler reachable from `message`.
    ///
    /// Keys are visited in the discoverer's order (concrete type first); each
    /// key's routes in registration order. An unrouted message yields an empty
    /// vector, a warning, and an increment of [`MessageHandlerTable::unrouted_count`].
    #[must_use]
    pub fn get_handlers(
        &self,
        message: &Payload,
        resolver: &dyn DependencyResolver,
    ) -> Vec<RoutedHandler> {
        let views = self.discoverer.views(message);

        // Routes are cloned out so factories run without holding the lock.
        let matched: Vec<(MessageView, Vec<Route>)> = {
            let routes = self.routes.read();
            views
                .into_iter()
                .filter_map(|view| {
                    routes
                        .get(&view.key().id())
                        .map(|found| (view, found.clone()))
                })
                .collect()
        };

        let handlers: Vec<RoutedHandler> = matched
            .into_iter()
            .flat_map(|(view, routes)| {
                routes.into_iter().map(move |route| RoutedHandler {
                    view: view.clone(),
                    handler: route(resolver),
                })
            })
            .collect();

        if handlers.is_empty() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_type = message.type_name(),
                "no registered handlers found"
            );
        }
        handlers
    }

    /// Removes every route.
    pub fn reset(&self) {
        self.routes.write().clear();
    }

    /// Total number of registered routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.read().values().map(Vec::len).sum()
    }

    /// Number of lookups that found no handler.
    #[must_use]
    pub fn unrouted_count(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }
}
