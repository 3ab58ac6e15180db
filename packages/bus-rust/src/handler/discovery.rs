//! Routing keys and the collaborators that compute them for a message.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use courier_core::Payload;
use parking_lot::RwLock;

/// Identity of a routable type: a concrete message or a capability trait object.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Key of the concrete type carried by `payload`.
    #[must_use]
    pub fn of_payload(payload: &Payload) -> Self {
        Self {
            id: payload.type_id(),
            name: payload.type_name(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A message seen through one of its routing keys.
#[derive(Clone)]
pub enum MessageView {
    /// The payload itself, routed under its concrete type.
    Concrete(Payload),
    /// The payload cast to a capability. `value` holds an `Arc<C>` for the
    /// capability trait object `C` named by `key`.
    Capability {
        key: TypeKey,
        value: Arc<dyn Any + Send + Sync>,
    },
}

impl MessageView {
    #[must_use]
    pub fn key(&self) -> TypeKey {
        match self {
            Self::Concrete(payload) => TypeKey::of_payload(payload),
            Self::Capability { key, .. } => *key,
        }
    }

    /// The concrete message, if this view is concrete and of type `M`.
    #[must_use]
    pub fn concrete<M: Any>(&self) -> Option<&M> {
        match self {
            Self::Concrete(payload) => payload.downcast_ref::<M>(),
            Self::Capability { .. } => None,
        }
    }

    /// The capability handle, if this view exposes `C`.
    #[must_use]
    pub fn capability<C: ?Sized + 'static>(&self) -> Option<&Arc<C>> {
        match self {
            Self::Capability { value, .. } => value.downcast_ref::<Arc<C>>(),
            Self::Concrete(_) => None,
        }
    }
}

impl fmt::Debug for MessageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageView").field(&self.key()).finish()
    }
}

/// Computes the ordered routing views of a message: its concrete type first,
/// then any declared capabilities.
pub trait DiscoverMessageTypes: Send + Sync + 'static {
    fn views(&self, message: &Payload) -> Vec<MessageView>;

    fn keys(&self, message: &Payload) -> Vec<TypeKey> {
        self.views(message).iter().map(MessageView::key).collect()
    }
}

type CapabilityCast = Arc<dyn Fn(&Payload) -> Option<Arc<dyn Any + Send + Sync>> + Send + Sync>;

/// Default discoverer backed by explicit capability declarations.
///
/// Rust has no runtime interface reflection, so each `(message, capability)`
/// pair is declared once with the cast that produces the trait object.
#[derive(Default)]
pub struct MessageTypeRegistry {
    capabilities: RwLock<HashMap<TypeId, Vec<(TypeKey, CapabilityCast)>>>,
}

impl MessageTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that messages of type `M` expose capability `C`.
    ///
    /// Capabilities are reported in declaration order. Declaring the same
    /// pair twice keeps the first cast.
    pub fn declare<M, C>(&self, cast: impl Fn(Arc<M>) -> Arc<C> + Send + Sync + 'static)
    where
        M: Any + Send + Sync,
        C: ?Sized + Send + Sync + 'static,
    {
        let key = TypeKey::of::<C>();
        let erased: CapabilityCast = Arc::new(move |payload: &Payload| {
            let message = payload.downcast_arc::<M>()?;
            let capability: Arc<C> = cast(message);
            Some(Arc::new(capability) as Arc<dyn Any + Send + Sync>)
        });

        let mut capabilities = self.capabilities.write();
        let declared = capabilities.entry(TypeId::of::<M>()).or_default();
        if !declared.iter().any(|(existing, _)| *existing == key) {
            declared.push((key, erased));
        }
    }

    /// Capability keys declared for `M`.
    #[must_use]
    pub fn capabilities_of<M: Any>(&self) -> Vec<TypeKey> {
        self.capabilities
            .read()
            .get(&TypeId::of::<M>())
            .map(|declared| declared.iter().map(|(key, _)| *key).collect())
            .unwrap_or_default()
    }
}

impl DiscoverMessageTypes for MessageTypeRegistry {
    fn views(&self, message: &Payload) -> Vec<MessageView> {
        let mut views = vec![MessageView::Concrete(message.clone())];
        if let Some(declared) = self.capabilities.read().get(&message.type_id()) {
            views.extend(declared.iter().filter_map(|(key, cast)| {
                cast(message).map(|value| MessageView::Capability { key: *key, value })
            }));
        }
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Trackable: Send + Sync {
        fn tracking_number(&self) -> u32;
    }

    trait Billable: Send + Sync {}

    struct Order {
        id: u32,
    }

    impl Trackable for Order {
        fn tracking_number(&self) -> u32 {
            self.id * 10
        }
    }

    impl Billable for Order {}

    #[test]
    fn concrete_type_comes_first() {
        let registry = MessageTypeRegistry::new();
        registry.declare::<Order, dyn Trackable>(|order| order);
        registry.declare::<Order, dyn Billable>(|order| order);
        registry.declare::<Order, dyn Trackable>(|order| order);

        let keys = registry.keys(&Payload::new(Order { id: 1 }));
        assert_eq!(
            keys,
            vec![
                TypeKey::of::<Order>(),
                TypeKey::of::<dyn Trackable>(),
                TypeKey::of::<dyn Billable>()
            ]
        );
        assert_eq!(registry.capabilities_of::<Order>().len(), 2);
    }

    #[test]
    fn capability_view_exposes_trait_object() {
        let registry = MessageTypeRegistry::new();
        registry.declare::<Order, dyn Trackable>(|order| order);

        let views = registry.views(&Payload::new(Order { id: 4 }));
        assert_eq!(views[0].concrete::<Order>().map(|o| o.id), Some(4));
        assert!(views[0].capability::<dyn Trackable>().is_none());

        let trackable = views[1].capability::<dyn Trackable>().unwrap();
        assert_eq!(trackable.tracking_number(), 40);
        assert!(views[1].concrete::<Order>().is_none());
    }

    #[test]
    fn undeclared_types_have_only_their_concrete_key() {
        let registry = MessageTypeRegistry::new();
        let keys = registry.keys(&Payload::new(7_i64));
        assert_eq!(keys, vec![TypeKey::of::<i64>()]);
        assert_eq!(format!("{:?}", keys[0]), "i64");
    }
}
