//! The channel contract and the collaborators channels are wired with.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ChannelEnvelope, ChannelGroupConfig, ChannelMessage};

use super::delivery::Delivery;
use crate::error::BusError;

/// Deferred work attached to a transaction.
pub type TransactionAction = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// MessagingChannel
// ---------------------------------------------------------------------------

/// One logical connection to a transport.
///
/// Implemented by transports and by the decorators in this module, which wrap
/// another channel and delegate whatever they do not handle themselves. A
/// channel is held by one worker (or one pool borrower) at a time.
#[async_trait]
pub trait MessagingChannel: Send + Sync + 'static {
    /// Hands an envelope to the transport within the current transaction.
    async fn send(&self, envelope: &ChannelEnvelope) -> Result<(), BusError>;

    /// Performs one receive bounded by the group's receive timeout and
    /// invokes `handler` at most once.
    ///
    /// Returns `Ok(())` when nothing arrived in time or the channel is
    /// shutting down. Handler errors are returned to the caller after the
    /// delivery's transaction has been resolved.
    async fn receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), BusError>;

    /// Stops accepting deliveries; a pending receive returns without a message.
    fn begin_shutdown(&self);

    /// The message being delivered, while a receive callback is active.
    fn current_message(&self) -> Option<Arc<ChannelMessage>>;

    /// The transaction new sends are enlisted in.
    fn current_transaction(&self) -> Arc<dyn ChannelTransaction>;

    fn current_configuration(&self) -> Arc<ChannelGroupConfig>;

    /// The scoped resolver of the active delivery, if any.
    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>>;

    /// Releases the channel. Idempotent.
    fn dispose(&self);
}

// ---------------------------------------------------------------------------
// ChannelTransaction
// ---------------------------------------------------------------------------

/// Local unit of work scoped to one receive or dispatch.
#[async_trait]
pub trait ChannelTransaction: Send + Sync + 'static {
    /// Registers an action to run after a successful commit.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidOperation` once the transaction is finished.
    fn register(&self, action: TransactionAction) -> Result<(), BusError>;

    /// Applies enlisted work, then runs post-commit actions. Committing a
    /// committed transaction is a no-op.
    async fn commit(&self) -> Result<(), BusError>;

    /// Discards enlisted work. Rolling back a rolled-back transaction is a no-op.
    async fn rollback(&self) -> Result<(), BusError>;

    fn is_finished(&self) -> bool;
}

// ---------------------------------------------------------------------------
// DeliveryHandler
// ---------------------------------------------------------------------------

/// Consumer of a single delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// ChannelConnector
// ---------------------------------------------------------------------------

/// Observable state of a connector's underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Disconnected,
    Unauthorized,
    Unreachable,
}

/// Opens channels for the configured groups.
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    /// Opens a channel for `group_name`.
    ///
    /// # Errors
    ///
    /// `BusError::Connection` when the transport is unreachable;
    /// `BusError::InvalidArgument` for an unknown group.
    async fn connect(&self, group_name: &str) -> Result<Arc<dyn MessagingChannel>, BusError>;

    fn current_state(&self) -> ConnectionState;

    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfig>>;

    fn dispose(&self);
}

// ---------------------------------------------------------------------------
// Auditing
// ---------------------------------------------------------------------------

/// Observes traffic through an audited channel.
pub trait MessageAuditor: Send + Sync + 'static {
    /// Runs after the transaction carrying `envelope` has committed.
    fn audit_send(&self, envelope: &ChannelEnvelope, channel: &dyn MessagingChannel);

    /// Runs before the consumer sees the delivery; may normalise the message.
    fn audit_receive(&self, delivery: &mut Delivery);

    fn dispose(&self) {}
}

// ---------------------------------------------------------------------------
// Dependency resolution
// ---------------------------------------------------------------------------

/// Scoped service lookup used to materialise handlers per delivery.
pub trait DependencyResolver: Send + Sync + 'static {
    fn get(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Opens a child scope. The caller releases it when the delivery ends.
    fn create_nested(&self) -> Arc<dyn DependencyResolver>;

    /// Ends this scope.
    fn release(&self);
}

impl dyn DependencyResolver {
    /// Typed lookup.
    #[must_use]
    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

/// Resolver with no registrations, used when a delivery has no scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl DependencyResolver for NullResolver {
    fn get(&self, _type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    fn create_nested(&self) -> Arc<dyn DependencyResolver> {
        Arc::new(Self)
    }

    fn release(&self) {}
}
