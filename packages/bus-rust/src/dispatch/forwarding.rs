use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Address, ChannelEnvelope, ChannelMessage, Payload};
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DispatchContext;
use crate::channel::{ChannelTransaction, MessagingChannel};
use crate::error::BusError;

/// Re-sends an already-built message, unchanged, to a fixed set of recipients.
///
/// Every mutator fails with `BusError::NotSupported`; only `send` is legal,
/// and only once.
pub struct ForwardingDispatchContext {
    channel: Arc<dyn MessagingChannel>,
    envelope: ChannelEnvelope,
    dispatched: bool,
}

impl ForwardingDispatchContext {
    /// # Errors
    ///
    /// `BusError::Envelope` if `recipients` is empty.
    pub fn new(
        channel: Arc<dyn MessagingChannel>,
        message: Arc<ChannelMessage>,
        recipients: impl IntoIterator<Item = Address>,
    ) -> Result<Self, BusError> {
        Ok(Self {
            channel,
            envelope: ChannelEnvelope::new(message, recipients)?,
            dispatched: false,
        })
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        self.envelope.recipients()
    }

    fn immutable<T>(what: &'static str) -> Result<T, BusError> {
        Err(BusError::NotSupported(what))
    }
}

#[async_trait]
impl DispatchContext for ForwardingDispatchContext {
    fn message_count(&self) -> usize {
        if self.dispatched {
            0
        } else {
            self.envelope.message().messages().len()
        }
    }

    fn header_count(&self) -> usize {
        self.envelope.message().headers().len()
    }

    fn with_message(&mut self, _message: Payload) -> Result<&mut Self, BusError> {
        Self::immutable("the message collection cannot be modified")
    }

    fn with_messages(&mut self, _messages: Vec<Payload>) -> Result<&mut Self, BusError> {
        Self::immutable("the message collection cannot be modified")
    }

    fn with_header(&mut self, _key: &str, _value: &str) -> Result<&mut Self, BusError> {
        Self::immutable("the headers cannot be modified")
    }

    fn with_headers(&mut self, _headers: BTreeMap<String, String>) -> Result<&mut Self, BusError> {
        Self::immutable("the headers cannot be modified")
    }

    fn with_correlation_id(&mut self, _correlation_id: Uuid) -> Result<&mut Self, BusError> {
        Self::immutable("the correlation identifier cannot be modified")
    }

    fn with_recipient(&mut self, _recipient: Address) -> Result<&mut Self, BusError> {
        Self::immutable("the recipients cannot be modified")
    }

    async fn send(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        if self.dispatched {
            warn!("the set of messages has already been dispatched");
            return Err(BusError::AlreadyDispatched);
        }

        self.channel.send(&self.envelope).await?;
        self.dispatched = true;

        let configuration = self.channel.current_configuration();
        counter!("courier_dispatches_total", "group" => configuration.group_name.clone())
            .increment(1);
        debug!(
            message_id = %self.envelope.message().message_id(),
            recipients = self.envelope.recipients().len(),
            "message forwarded"
        );
        Ok(self.channel.current_transaction())
    }

    async fn publish(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        Self::immutable("only send can be invoked on a forwarded message")
    }

    async fn reply(&mut self) -> Result<Arc<dyn ChannelTransaction>, BusError> {
        Self::immutable("only send can be invoked on a forwarded message")
    }
}

#[cfg(test)]
mod tests {
    use courier_core::ChannelGroupConfig;

    use super::*;
    use crate::transport::memory::{MemoryBroker, MemoryConnector};
    use crate::ChannelConnector;

    fn addr(value: &str) -> Address {
        Address::parse(value).unwrap()
    }

    async fn forwarding(broker: &Arc<MemoryBroker>) -> (ForwardingDispatchContext, Uuid) {
        let connector =
            MemoryConnector::new(Arc::clone(broker), [ChannelGroupConfig::named("relay")]);
        let channel = connector.connect("relay").await.unwrap();
        let message = Arc::new(ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BTreeMap::new(),
            vec![Payload::new(42_u32)],
        ));
        let id = message.message_id();
        let context =
            ForwardingDispatchContext::new(channel, message, [addr("archive"), addr("archive")])
                .unwrap();
        (context, id)
    }

    #[tokio::test]
    async fn every_mutator_is_rejected() {
        let broker = MemoryBroker::new();
        let (mut context, _) = forwarding(&broker).await;

        assert_eq!(context.recipients(), &[addr("archive")]);
        assert!(matches!(
            context.with_message(Payload::new(1_u8)),
            Err(BusError::NotSupported(msg)) if msg.contains("cannot be modified")
        ));
        assert!(context.with_messages(vec![]).is_err());
        assert!(context.with_header("k", "v").is_err());
        assert!(context.with_headers(BTreeMap::new()).is_err());
        assert!(context.with_correlation_id(Uuid::new_v4()).is_err());
        assert!(matches!(
            context.with_recipient(addr("elsewhere")),
            Err(BusError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn only_send_once() {
        let broker = MemoryBroker::new();
        let (mut context, id) = forwarding(&broker).await;

        assert!(matches!(
            context.publish().await,
            Err(BusError::NotSupported(msg)) if msg.contains("only send")
        ));
        assert!(matches!(context.reply().await, Err(BusError::NotSupported(_))));

        assert_eq!(context.message_count(), 1);
        context.send().await.unwrap().commit().await.unwrap();
        assert_eq!(context.message_count(), 0);
        assert!(matches!(context.send().await, Err(BusError::AlreadyDispatched)));

        let archived = broker.drain("archive");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].message_id(), id);
    }

    #[tokio::test]
    async fn empty_recipients_fail() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker, [ChannelGroupConfig::named("relay")]);
        let channel = connector.connect("relay").await.unwrap();
        let message = Arc::new(ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BTreeMap::new(),
            vec![],
        ));
        assert!(matches!(
            ForwardingDispatchContext::new(channel, message, Vec::new()),
            Err(BusError::Envelope(_))
        ));
    }
}
