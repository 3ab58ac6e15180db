use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use super::table::MessageHandlerTable;
use crate::channel::{Delivery, DeliveryHandler, DependencyResolver, NullResolver};
use crate::error::BusError;

/// Delivery consumer that routes every payload through a handler table.
///
/// Handlers are materialised against the delivery's resolver scope, or
/// against [`NullResolver`] when the channel has no resolver decorator.
/// Payloads are handled in order; the first failing handler aborts the
/// delivery.
pub struct MessageRouter {
    table: Arc<MessageHandlerTable>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(table: Arc<MessageHandlerTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl DeliveryHandler for MessageRouter {
    async fn handle(&self, delivery: &mut Delivery) -> Result<(), BusError> {
        let resolver: Arc<dyn DependencyResolver> = delivery
            .resolver()
            .cloned()
            .unwrap_or_else(|| Arc::new(NullResolver));
        let delivery: &Delivery = delivery;

        for payload in delivery.message().messages() {
            let span = info_span!("route", message_type = payload.type_name());
            for handler in self.table.get_handlers(payload, resolver.as_ref()) {
                handler
                    .handle(delivery)
                    .instrument(span.clone())
                    .await
                    .map_err(BusError::Handler)?;
            }
        }
        Ok(())
    }
}
