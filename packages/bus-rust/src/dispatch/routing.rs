use std::sync::Arc;

use courier_core::{Address, Payload};
use dashmap::DashMap;

use crate::handler::{DiscoverMessageTypes, TypeKey};

/// Resolves the subscribers of a published message.
pub trait PublishRouter: Send + Sync + 'static {
    fn subscribers(&self, message: &Payload) -> Vec<Address>;
}

/// Fixed subscription table keyed by message or capability type.
///
/// A message reaches the subscribers of every key its discoverer reports,
/// concrete type first, without duplicates.
pub struct StaticSubscriptions {
    discoverer: Arc<dyn DiscoverMessageTypes>,
    routes: DashMap<TypeKey, Vec<Address>>,
}

impl StaticSubscriptions {
    #[must_use]
    pub fn new(discoverer: Arc<dyn DiscoverMessageTypes>) -> Self {
        Self {
            discoverer,
            routes: DashMap::new(),
        }
    }

    /// Subscribes `address` to messages reachable under `T`, which may be a
    /// concrete message type or a capability trait object.
    pub fn subscribe<T: ?Sized + 'static>(&self, address: Address) {
        self.subscribe_key(TypeKey::of::<T>(), address);
    }

    pub fn subscribe_key(&self, key: TypeKey, address: Address) {
        let mut entry = self.routes.entry(key).or_default();
        if !entry.contains(&address) {
            entry.push(address);
        }
    }
}

impl PublishRouter for StaticSubscriptions {
    fn subscribers(&self, message: &Payload) -> Vec<Address> {
        let mut subscribers: Vec<Address> = Vec::new();
        for key in self.discoverer.keys(message) {
            if let Some(addresses) = self.routes.get(&key) {
                for address in addresses.iter() {
                    if !subscribers.contains(address) {
                        subscribers.push(address.clone());
                    }
                }
            }
        }
        subscribers
    }
}
