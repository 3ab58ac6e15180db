//! Inbound routing: from a delivered payload to the handlers registered for
//! its concrete type and declared capabilities.

pub mod discovery;
pub mod router;
pub mod table;

pub use discovery::{DiscoverMessageTypes, MessageTypeRegistry, MessageView, TypeKey};
pub use router::MessageRouter;
pub use table::{HandleMessage, MessageHandlerTable, RoutedHandler};
