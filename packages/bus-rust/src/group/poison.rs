//! Retry accounting and poison-message handling at the delivery boundary.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{headers, ChannelGroupConfig};
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::{Delivery, DeliveryHandler};
use crate::dispatch::{DispatchContext, ForwardingDispatchContext, PublishRouter};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// FailureTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: u32,
    pub last_error: String,
}

/// Failed delivery attempts per message id, shared by a group's workers.
#[derive(Debug, Default)]
pub struct FailureTracker {
    records: DashMap<Uuid, FailureRecord>,
}

impl FailureTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed attempt and returns the attempt count so far.
    pub fn record(&self, message_id: Uuid, err: &BusError) -> u32 {
        let mut entry = self.records.entry(message_id).or_insert_with(|| FailureRecord {
            attempts: 0,
            last_error: String::new(),
        });
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = err.to_string();
        entry.attempts
    }

    #[must_use]
    pub fn get(&self, message_id: Uuid) -> Option<FailureRecord> {
        self.records.get(&message_id).map(|record| record.value().clone())
    }

    pub fn clear(&self, message_id: Uuid) {
        self.records.remove(&message_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DeliveryGuard
// ---------------------------------------------------------------------------

/// Innermost wrapper around a group's consumer.
///
/// Resolves the delivery's transaction on the consumer's behalf: commit on
/// success, rollback on failure so the transport redelivers. A message that
/// has already failed `max_attempts` times is forwarded to the poison address
/// instead of being handed to the consumer again. Only connection failures
/// propagate to the worker.
pub struct DeliveryGuard {
    inner: Arc<dyn DeliveryHandler>,
    failures: Arc<FailureTracker>,
    config: Arc<ChannelGroupConfig>,
    router: Option<Arc<dyn PublishRouter>>,
}

impl DeliveryGuard {
    #[must_use]
    pub fn new(
        inner: Arc<dyn DeliveryHandler>,
        failures: Arc<FailureTracker>,
        config: Arc<ChannelGroupConfig>,
        router: Option<Arc<dyn PublishRouter>>,
    ) -> Self {
        Self {
            inner,
            failures,
            config,
            router,
        }
    }

    fn exhausted(&self, record: &FailureRecord) -> bool {
        let max = self.config.max_attempts;
        max > 0 && record.attempts >= max
    }

    async fn poison(&self, delivery: &mut Delivery, record: &FailureRecord) -> Result<(), BusError> {
        let group = self.config.group_name.clone();
        let message_id = delivery.message().message_id();
        counter!("courier_poison_messages_total", "group" => group.clone()).increment(1);

        let Some(poison_address) = self.config.poison_address.clone() else {
            error!(
                group = %group,
                message_id = %message_id,
                attempts = record.attempts,
                reason = %record.last_error,
                "dropping poison message: no poison address configured"
            );
            return delivery.transaction().commit().await;
        };

        let mut poisoned = delivery.message().clone();
        let payload_types = poisoned.payload_types();
        let stamped = poisoned.headers_mut();
        stamped.insert(headers::POISON_ATTEMPTS.into(), record.attempts.to_string());
        stamped.insert(headers::POISON_REASON.into(), record.last_error.clone());
        stamped.insert(headers::POISON_SOURCE_GROUP.into(), group.clone());
        stamped.insert(headers::POISON_PAYLOAD_TYPES.into(), payload_types);

        let mut forward = ForwardingDispatchContext::new(
            Arc::clone(delivery.channel()),
            Arc::new(poisoned),
            [poison_address.clone()],
        )?;
        forward.send().await?;
        delivery.transaction().commit().await?;

        warn!(
            group = %group,
            message_id = %message_id,
            attempts = record.attempts,
            poison_address = %poison_address,
            "message forwarded to poison address"
        );
        Ok(())
    }

    async fn rollback(delivery: &Delivery) {
        let transaction = delivery.transaction();
        if transaction.is_finished() {
            return;
        }
        if let Err(err) = transaction.rollback().await {
            warn!(error = %err, "failed to roll back delivery");
        }
    }
}

#[async_trait]
impl DeliveryHandler for DeliveryGuard {
    async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
        delivery.set_publish_router(self.router.clone());
        let message_id = delivery.message().message_id();
        let group = self.config.group_name.clone();
        counter!("courier_deliveries_total", "group" => group.clone()).increment(1);

        let exhausted = self
            .failures
            .get(message_id)
            .filter(|record| self.exhausted(record));
        if let Some(record) = exhausted {
            return match self.poison(delivery, &record).await {
                Ok(()) => {
                    self.failures.clear(message_id);
                    Ok(())
                }
                Err(err) => {
                    Self::rollback(delivery).await;
                    if err.is_connection() {
                        return Err(err);
                    }
                    error!(group = %group, message_id = %message_id, error = %err, "failed to poison message");
                    Ok(())
                }
            };
        }

        let span = info_span!("delivery", group = %group, message_id = %message_id);
        match self.inner.handle(delivery).instrument(span).await {
            Ok(()) => {
                if !delivery.transaction().is_finished() {
                    delivery.transaction().commit().await?;
                }
                self.failures.clear(message_id);
                debug!(group = %group, message_id = %message_id, "delivery handled");
                Ok(())
            }
            Err(err) => {
                let attempts = self.failures.record(message_id, &err);
                counter!("courier_delivery_failures_total", "group" => group.clone()).increment(1);
                warn!(
                    group = %group,
                    message_id = %message_id,
                    attempts,
                    error = %err,
                    "delivery failed"
                );
                Self::rollback(delivery).await;
                if err.is_connection() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }
}
