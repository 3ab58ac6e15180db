//! Audit decorator: runs auditors after sends commit and before deliveries
//! reach the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{headers, ChannelEnvelope, ChannelGroupConfig, ChannelMessage};
use tower::Layer;
use tracing::{info, trace, warn};

use super::delivery::Delivery;
use super::traits::{
    ChannelTransaction, DeliveryHandler, DependencyResolver, MessageAuditor, MessagingChannel,
};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// AuditLayer
// ---------------------------------------------------------------------------

/// Wraps a channel in an [`AuditChannel`]. With no auditors the channel is
/// returned unchanged.
#[derive(Clone, Default)]
pub struct AuditLayer {
    auditors: Vec<Arc<dyn MessageAuditor>>,
}

impl AuditLayer {
    #[must_use]
    pub fn new(auditors: Vec<Arc<dyn MessageAuditor>>) -> Self {
        Self { auditors }
    }
}

impl Layer<Arc<dyn MessagingChannel>> for AuditLayer {
    type Service = Arc<dyn MessagingChannel>;

    fn layer(&self, inner: Arc<dyn MessagingChannel>) -> Self::Service {
        if self.auditors.is_empty() {
            return inner;
        }
        AuditChannel::wrap(inner, self.auditors.clone())
    }
}

// ---------------------------------------------------------------------------
// AuditChannel
// ---------------------------------------------------------------------------

pub struct AuditChannel {
    inner: Arc<dyn MessagingChannel>,
    auditors: Arc<[Arc<dyn MessageAuditor>]>,
    this: Weak<AuditChannel>,
    disposed: AtomicBool,
}

impl AuditChannel {
    /// # Errors
    ///
    /// `BusError::InvalidArgument` if `auditors` is empty.
    pub fn new(
        inner: Arc<dyn MessagingChannel>,
        auditors: Vec<Arc<dyn MessageAuditor>>,
    ) -> Result<Arc<Self>, BusError> {
        if auditors.is_empty() {
            return Err(BusError::invalid_argument(
                "auditors",
                "at least one auditor is required",
            ));
        }
        Ok(Self::wrap(inner, auditors))
    }

    fn wrap(inner: Arc<dyn MessagingChannel>, auditors: Vec<Arc<dyn MessageAuditor>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            auditors: auditors.into(),
            this: this.clone(),
            disposed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessagingChannel for AuditChannel {
    async fn send(&self, envelope: &ChannelEnvelope) -> Result<(), BusError> {
        trace!(message_id = %envelope.message().message_id(), "sending through audited channel");
        self.inner.send(envelope).await?;

        let auditors = Arc::clone(&self.auditors);
        let channel = self.this.clone();
        let envelope = envelope.clone();
        self.inner.current_transaction().register(Box::new(move || {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            for auditor in auditors.iter() {
                auditor.audit_send(&envelope, channel.as_ref());
            }
        }))
    }

    async fn receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), BusError> {
        let auditing = Arc::new(AuditingHandler {
            auditors: Arc::clone(&self.auditors),
            channel: self.this.clone(),
            inner: handler,
        });
        self.inner.receive(auditing).await
    }

    fn begin_shutdown(&self) {
        self.inner.begin_shutdown();
    }

    fn current_message(&self) -> Option<Arc<ChannelMessage>> {
        self.inner.current_message()
    }

    fn current_transaction(&self) -> Arc<dyn ChannelTransaction> {
        self.inner.current_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfig> {
        self.inner.current_configuration()
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        self.inner.current_resolver()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for auditor in self.auditors.iter() {
            auditor.dispose();
        }
        self.inner.dispose();
    }
}

struct AuditingHandler {
    auditors: Arc<[Arc<dyn MessageAuditor>]>,
    channel: Weak<AuditChannel>,
    inner: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for AuditingHandler {
    async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
        if let Some(channel) = self.channel.upgrade() {
            delivery.set_channel(channel);
        }
        for auditor in self.auditors.iter() {
            auditor.audit_receive(delivery);
        }
        self.inner.handle(delivery).await
    }
}

// ---------------------------------------------------------------------------
// PointOfOriginAuditor
// ---------------------------------------------------------------------------

/// Restores the origin dispatch time on receipt and logs the origin of sends.
///
/// Transports stamp `x-audit-dispatched` when a message leaves the process;
/// on receipt this auditor copies it back into the message's dispatch time.
#[derive(Debug, Clone)]
pub struct PointOfOriginAuditor {
    host: String,
}

impl Default for PointOfOriginAuditor {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self::with_host(host)
    }
}

impl PointOfOriginAuditor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into().to_lowercase(),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl MessageAuditor for PointOfOriginAuditor {
    fn audit_send(&self, envelope: &ChannelEnvelope, _channel: &dyn MessagingChannel) {
        let message = envelope.message();
        info!(
            message_id = %message.message_id(),
            origin_host = %self.host,
            dispatched = %message.dispatched().to_rfc3339(),
            recipients = envelope.recipients().len(),
            "message dispatched"
        );
    }

    fn audit_receive(&self, delivery: &mut Delivery) {
        let Some(stamp) = delivery.message().headers().get(headers::AUDIT_DISPATCHED).cloned() else {
            return;
        };
        match DateTime::parse_from_rfc3339(&stamp) {
            Ok(dispatched) => delivery
                .message_mut()
                .set_dispatched(dispatched.with_timezone(&Utc)),
            Err(err) => warn!(
                header = headers::AUDIT_DISPATCHED,
                value = %stamp,
                error = %err,
                "ignoring malformed dispatch stamp"
            ),
        }
    }
}
