//! Courier bus: channel groups, worker pools, channel decorators, dispatch
//! contexts and handler routing over pluggable transports.
//!
//! Transports implement [`ChannelConnector`] and [`MessagingChannel`]. A
//! [`ChannelGroup`] owns the connection lifecycle of one configured group and
//! runs its receive workers; every delivery passes through the decorator
//! chain built by [`ChannelStack`] and the retry/poison boundary before it
//! reaches a [`DeliveryHandler`] such as [`MessageRouter`].

pub mod backoff;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod handler;
pub mod logging;
pub mod transport;
pub mod worker;

pub use backoff::ReconnectBackoff;
pub use channel::{
    AuditLayer, ChannelConnector, ChannelStack, ChannelTransaction, ConnectionState, Delivery,
    DeliveryHandler, DependencyResolver, LocalTransaction, MessageAuditor, MessagingChannel,
    NullResolver, PointOfOriginAuditor, PooledDispatchConnector, ResolverLayer,
};
pub use dispatch::{
    DispatchContext, ForwardingDispatchContext, MessageDispatchContext, PublishRouter,
    StaticSubscriptions,
};
pub use error::BusError;
pub use group::{ChannelGroup, DeliveryGuard, FailureTracker, GroupState};
pub use handler::{
    DiscoverMessageTypes, HandleMessage, MessageHandlerTable, MessageRouter, MessageTypeRegistry,
};
pub use transport::{MemoryBroker, MemoryConnector};
pub use worker::{
    RestartHandle, RestartPolicy, WorkItem, WorkerActivity, WorkerGroup, WorkerStateFactory,
};
