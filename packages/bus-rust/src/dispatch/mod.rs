//! Outbound dispatch: single-use builders that turn payloads into envelopes.
//!
//! A dispatch context accumulates payloads, headers, a correlation id and
//! recipients, then produces exactly one envelope through one terminal call
//! (`send`, `publish` or `reply`). Every terminal call returns the transaction
//! the envelope was enlisted in, so the caller decides when it commits.

pub mod context;
pub mod forwarding;
pub mod routing;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Address, Payload};
use uuid::Uuid;

use crate::channel::ChannelTransaction;
use crate::error::BusError;

pub use context::MessageDispatchContext;
pub use forwarding::ForwardingDispatchContext;
pub use routing::{PublishRouter, StaticSubscriptions};

/// Builder over one outbound unit.
///
/// Mutators return `&mut Self` so calls chain with `?`. After the first
/// successful terminal call every method fails with
/// `BusError::AlreadyDispatched`.
#[async_trait]
pub trait DispatchContext: Send {
    /// Number of payloads accumulated so far.
    fn message_count(&self) -> usize;

    fn header_count(&self) -> usize;

    fn with_message(&mut self, message: Payload) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    fn with_messages(&mut self, messages: Vec<Payload>) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    /// Sets a header; a later write to the same key wins.
    fn with_header(&mut self, key: &str, value: &str) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    fn with_headers(&mut self, headers: BTreeMap<String, String>) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    /// Assigns the correlation id. Allowed once.
    fn with_correlation_id(&mut self, correlation_id: Uuid) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    fn with_recipient(&mut self, recipient: Address) -> Result<&mut Self, BusError>
    where
        Self: Sized;

    /// Sends to the accumulated recipients.
    async fn send(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError>;

    /// Sends to every subscriber of the first payload's type.
    async fn publish(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError>;

    /// Sends to the return address of the message being handled.
    async fn reply(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError>;
}
