use std::sync::Arc;

use courier_core::{Address, ChannelGroupConfig, ChannelMessage};

use super::traits::{ChannelTransaction, DependencyResolver, MessagingChannel};
use crate::dispatch::{ForwardingDispatchContext, MessageDispatchContext, PublishRouter};
use crate::error::BusError;

/// Context of one received message, handed down the receive chain.
///
/// Transports create it; each decorator's receive wrapper updates it on the
/// way in (re-pointing [`Delivery::channel`] at itself, attaching a resolver
/// scope) so that a handler always talks to the outermost channel.
pub struct Delivery {
    message: Arc<ChannelMessage>,
    transaction: Arc<dyn ChannelTransaction>,
    configuration: Arc<ChannelGroupConfig>,
    channel: Arc<dyn MessagingChannel>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    router: Option<Arc<dyn PublishRouter>>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        message: Arc<ChannelMessage>,
        transaction: Arc<dyn ChannelTransaction>,
        configuration: Arc<ChannelGroupConfig>,
        channel: Arc<dyn MessagingChannel>,
    ) -> Self {
        Self {
            message,
            transaction,
            configuration,
            channel,
            resolver: None,
            router: None,
        }
    }

    #[must_use]
    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    #[must_use]
    pub fn shared_message(&self) -> Arc<ChannelMessage> {
        Arc::clone(&self.message)
    }

    /// Mutable access for auditors; copies the message if it is shared.
    pub fn message_mut(&mut self) -> &mut ChannelMessage {
        Arc::make_mut(&mut self.message)
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<dyn ChannelTransaction> {
        &self.transaction
    }

    #[must_use]
    pub fn configuration(&self) -> &Arc<ChannelGroupConfig> {
        &self.configuration
    }

    /// The outermost channel the delivery has passed through.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn MessagingChannel> {
        &self.channel
    }

    pub fn set_channel(&mut self, channel: Arc<dyn MessagingChannel>) {
        self.channel = channel;
    }

    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<dyn DependencyResolver>> {
        self.resolver.as_ref()
    }

    pub fn set_resolver(&mut self, resolver: Option<Arc<dyn DependencyResolver>>) {
        self.resolver = resolver;
    }

    #[must_use]
    pub fn publish_router(&self) -> Option<&Arc<dyn PublishRouter>> {
        self.router.as_ref()
    }

    pub fn set_publish_router(&mut self, router: Option<Arc<dyn PublishRouter>>) {
        self.router = router;
    }

    /// A dispatch context bound to this delivery, for replies and follow-up
    /// messages sent within the delivery's transaction.
    #[must_use]
    pub fn prepare_dispatch(&self) -> MessageDispatchContext {
        MessageDispatchContext::new(Arc::clone(&self.channel))
            .in_reply_to(Arc::clone(&self.message))
            .with_router(self.router.clone())
    }

    /// A context that re-sends the delivered message unchanged to `recipients`.
    ///
    /// # Errors
    ///
    /// `BusError::Envelope` if `recipients` is empty.
    pub fn forward(
        &self,
        recipients: impl IntoIterator<Item = Address>,
    ) -> Result<ForwardingDispatchContext, BusError> {
        ForwardingDispatchContext::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.message),
            recipients,
        )
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message.message_id())
            .field("group", &self.configuration.group_name)
            .field("scoped", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}
