//! Channel abstraction, transactions and the decorator chain.

pub mod audit;
pub mod delivery;
pub mod pipeline;
pub mod pooled;
pub mod resolver;
pub mod traits;
pub mod transaction;

pub use audit::{AuditChannel, AuditLayer, PointOfOriginAuditor};
pub use delivery::Delivery;
pub use pipeline::ChannelStack;
pub use pooled::{PooledDispatchChannel, PooledDispatchConnector};
pub use resolver::{ResolverChannel, ResolverLayer};
pub use traits::{
    ChannelConnector, ChannelTransaction, ConnectionState, DeliveryHandler, DependencyResolver,
    MessageAuditor, MessagingChannel, NullResolver, TransactionAction,
};
pub use transaction::{LocalTransaction, TransactionStatus};
