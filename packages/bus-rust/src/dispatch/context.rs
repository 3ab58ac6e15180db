use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Address, ChannelEnvelope, ChannelMessage, Payload};
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DispatchContext, PublishRouter};
use crate::channel::{ChannelTransaction, MessagingChannel};
use crate::error::BusError;

/// The general-purpose dispatch builder.
///
/// Created directly over a channel for fresh messages, or through
/// [`Delivery::prepare_dispatch`](crate::channel::Delivery::prepare_dispatch)
/// so replies know the message being handled.
pub struct MessageDispatchContext {
    channel: Arc<dyn MessagingChannel>,
    router: Option<Arc<dyn PublishRouter>>,
    incoming: Option<Arc<ChannelMessage>>,
    messages: Vec<Payload>,
    headers: BTreeMap<String, String>,
    correlation_id: Option<Uuid>,
    recipients: Vec<Address>,
    dispatched: bool,
}

impl MessageDispatchContext {
    #[must_use]
    pub fn new(channel: Arc<dyn MessagingChannel>) -> Self {
        Self {
            channel,
            router: None,
            incoming: None,
            messages: Vec::new(),
            headers: BTreeMap::new(),
            correlation_id: None,
            recipients: Vec::new(),
            dispatched: false,
        }
    }

    /// Binds the message being handled, the target of [`DispatchContext::reply`].
    #[must_use]
    pub fn in_reply_to(mut self, incoming: Arc<ChannelMessage>) -> Self {
        self.incoming = Some(incoming);
        self
    }

    /// Sets the router used by [`DispatchContext::publish`].
    #[must_use]
    pub fn with_router(mut self, router: Option<Arc<dyn PublishRouter>>) -> Self {
        self.router = router;
        self
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.dispatched {
            warn!("the set of messages has already been dispatched");
            return Err(BusError::AlreadyDispatched);
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        recipients: Vec<Address>,
        correlation_id: Option<Uuid>,
    ) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        let configuration = self.channel.current_configuration();
        let message = ChannelMessage::new(
            Uuid::new_v4(),
            correlation_id.unwrap_or_else(Uuid::new_v4),
            configuration.return_address.clone(),
            self.headers.clone(),
            self.messages.clone(),
        );
        let envelope = ChannelEnvelope::new(message, recipients)?;

        self.channel.send(&envelope).await?;
        self.dispatched = true;

        counter!("courier_dispatches_total", "group" => configuration.group_name.clone())
            .increment(1);
        debug!(
            message_id = %envelope.message().message_id(),
            recipients = envelope.recipients().len(),
            "envelope dispatched"
        );
        Ok(self.channel.current_transaction())
    }

    fn ensure_messages(&self) -> Result<(), BusError> {
        if self.messages.is_empty() {
            return Err(BusError::InvalidOperation("no messages have been added"));
        }
        Ok(())
    }
}

#[async_trait]
impl DispatchContext for MessageDispatchContext {
    fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn header_count(&self) -> usize {
        self.headers.len()
    }

    fn with_message(&mut self, message: Payload) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        self.messages.push(message);
        Ok(self)
    }

    fn with_messages(&mut self, messages: Vec<Payload>) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        self.messages.extend(messages);
        Ok(self)
    }

    fn with_header(&mut self, key: &str, value: &str) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        self.headers.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    fn with_headers(&mut self, headers: BTreeMap<String, String>) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        self.headers.extend(headers);
        Ok(self)
    }

    fn with_correlation_id(&mut self, correlation_id: Uuid) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        if self.correlation_id.is_some() {
            return Err(BusError::InvalidOperation("correlation identifier already set"));
        }
        self.correlation_id = Some(correlation_id);
        Ok(self)
    }

    fn with_recipient(&mut self, recipient: Address) -> Result<&mut Self, BusError> {
        self.ensure_open()?;
        self.recipients.push(recipient);
        Ok(self)
    }

    async fn send(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        self.ensure_open()?;
        self.ensure_messages()?;
        let recipients = self.recipients.clone();
        self.dispatch(recipients, self.correlation_id).await
    }

    async fn publish(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        self.ensure_open()?;
        self.ensure_messages()?;
        let router = self
            .router
            .as_ref()
            .ok_or(BusError::InvalidOperation("no publish router configured"))?;
        let subscribers = router.subscribers(&self.messages[0]);
        self.dispatch(subscribers, self.correlation_id).await
    }

    async fn reply(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        self.ensure_open()?;
        self.ensure_messages()?;
        let incoming = self
            .incoming
            .as_ref()
            .ok_or(BusError::InvalidOperation("no incoming message to reply to"))?;
        let return_address = incoming
            .return_address()
            .cloned()
            .ok_or(BusError::InvalidOperation("the incoming message has no return address"))?;
        let correlation_id = self.correlation_id.or(Some(incoming.correlation_id()));
        self.dispatch(vec![return_address], correlation_id).await
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{ChannelGroupConfig, TransactionMode};

    use super::*;
    use crate::dispatch::StaticSubscriptions;
    use crate::handler::MessageTypeRegistry;
    use crate::transport::memory::{MemoryBroker, MemoryConnector};
    use crate::ChannelConnector;

    #[derive(Debug, PartialEq)]
    struct ShipOrder(u32);

    fn addr(value: &str) -> Address {
        Address::parse(value).unwrap()
    }

    async fn outbound(broker: &Arc<MemoryBroker>) -> Arc<dyn MessagingChannel> {
        let mut config = ChannelGroupConfig::named("outbound");
        config.dispatch_only = true;
        config.transaction_mode = TransactionMode::Full;
        config.return_address = Some(addr("outbound.replies"));
        MemoryConnector::new(Arc::clone(broker), [config])
            .connect("outbound")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_enlists_in_the_returned_transaction() {
        let broker = MemoryBroker::new();
        let mut context = MessageDispatchContext::new(outbound(&broker).await);

        let transaction = context
            .with_message(Payload::new(ShipOrder(1)))
            .unwrap()
            .with_header("tenant", "acme")
            .unwrap()
            .with_header("tenant", "globex")
            .unwrap()
            .with_recipient(addr("shipping"))
            .unwrap()
            .with_recipient(addr("shipping"))
            .unwrap()
            .send()
            .await
            .unwrap();

        assert_eq!(broker.queue_len("shipping"), 0);
        transaction.commit().await.unwrap();

        let delivered = broker.drain("shipping");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].headers()["tenant"], "globex");
        assert_eq!(delivered[0].return_address(), Some(&addr("outbound.replies")));
        assert_eq!(
            delivered[0].messages()[0].downcast_ref::<ShipOrder>(),
            Some(&ShipOrder(1))
        );
    }

    #[tokio::test]
    async fn exactly_one_terminal_call_succeeds() {
        let broker = MemoryBroker::new();
        let mut context = MessageDispatchContext::new(outbound(&broker).await);
        context
            .with_message(Payload::new(ShipOrder(2)))
            .unwrap()
            .with_recipient(addr("shipping"))
            .unwrap();

        context.send().await.unwrap();

        assert!(matches!(context.send().await, Err(BusError::AlreadyDispatched)));
        assert!(matches!(context.publish().await, Err(BusError::AlreadyDispatched)));
        assert!(matches!(context.reply().await, Err(BusError::AlreadyDispatched)));
        assert!(matches!(
            context.with_message(Payload::new(ShipOrder(3))),
            Err(BusError::AlreadyDispatched)
        ));
        assert!(matches!(
            context.with_header("k", "v"),
            Err(BusError::AlreadyDispatched)
        ));
        assert!(matches!(
            context.with_recipient(addr("other")),
            Err(BusError::AlreadyDispatched)
        ));
        assert!(matches!(
            context.with_correlation_id(Uuid::new_v4()),
            Err(BusError::AlreadyDispatched)
        ));
    }

    #[tokio::test]
    async fn correlation_id_is_single_assignment() {
        let broker = MemoryBroker::new();
        let mut context = MessageDispatchContext::new(outbound(&broker).await);
        let correlation = Uuid::new_v4();

        context.with_correlation_id(correlation).unwrap();
        let err = context.with_correlation_id(Uuid::new_v4()).err().unwrap();
        assert!(err.to_string().contains("already set"));

        context
            .with_message(Payload::new(ShipOrder(4)))
            .unwrap()
            .with_recipient(addr("shipping"))
            .unwrap();
        context.send().await.unwrap().commit().await.unwrap();
        assert_eq!(broker.drain("shipping")[0].correlation_id(), correlation);
    }

    #[tokio::test]
    async fn failed_terminal_calls_do_not_consume_the_context() {
        let broker = MemoryBroker::new();
        let mut context = MessageDispatchContext::new(outbound(&broker).await);

        assert!(matches!(context.send().await, Err(BusError::InvalidOperation(_))));

        context.with_message(Payload::new(ShipOrder(5))).unwrap();
        assert!(matches!(context.send().await, Err(BusError::Envelope(_))));
        assert!(matches!(context.reply().await, Err(BusError::InvalidOperation(_))));
        assert!(matches!(context.publish().await, Err(BusError::InvalidOperation(_))));

        context.with_recipient(addr("shipping")).unwrap();
        context.send().await.unwrap();
        assert_eq!(context.message_count(), 1);
    }

    #[tokio::test]
    async fn publish_targets_subscribers_of_the_first_payload() {
        let broker = MemoryBroker::new();
        let subscriptions = StaticSubscriptions::new(Arc::new(MessageTypeRegistry::new()));
        subscriptions.subscribe::<ShipOrder>(addr("warehouse"));
        subscriptions.subscribe::<ShipOrder>(addr("billing"));

        let mut context = MessageDispatchContext::new(outbound(&broker).await)
            .with_router(Some(Arc::new(subscriptions)));
        context
            .with_messages(vec![Payload::new(ShipOrder(6)), Payload::new(7_u64)])
            .unwrap();
        context.publish().await.unwrap().commit().await.unwrap();

        assert_eq!(broker.queue_len("warehouse"), 1);
        assert_eq!(broker.queue_len("billing"), 1);
    }

    #[tokio::test]
    async fn reply_targets_return_address_and_keeps_correlation() {
        let broker = MemoryBroker::new();
        let correlation = Uuid::new_v4();
        let incoming = Arc::new(ChannelMessage::new(
            Uuid::new_v4(),
            correlation,
            Some(addr("client.replies")),
            BTreeMap::new(),
            vec![Payload::new(ShipOrder(8))],
        ));

        let mut context =
            MessageDispatchContext::new(outbound(&broker).await).in_reply_to(incoming);
        context.with_message(Payload::new("shipped")).unwrap();
        context.reply().await.unwrap().commit().await.unwrap();

        let replies = broker.drain("client.replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id(), correlation);
    }
}
