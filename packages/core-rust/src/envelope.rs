use std::sync::Arc;

use crate::address::Address;
use crate::error::EnvelopeError;
use crate::message::ChannelMessage;

/// A message together with the resolved set of destinations.
///
/// Recipients are deduplicated in first-seen order. The set is read-only
/// once constructed.
#[derive(Debug, Clone)]
pub struct ChannelEnvelope {
    message: Arc<ChannelMessage>,
    recipients: Vec<Address>,
}

impl ChannelEnvelope {
    /// Wraps `message` for delivery to `recipients`.
    ///
    /// Accepts either `Address` or `Option<Address>` items; `None` entries are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::NoRecipients` if no address remains after
    /// filtering.
    pub fn new<I, A>(message: impl Into<Arc<ChannelMessage>>, recipients: I) -> Result<Self, EnvelopeError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Option<Address>>,
    {
        let mut unique: Vec<Address> = Vec::new();
        for recipient in recipients.into_iter().filter_map(Into::into) {
            if !unique.contains(&recipient) {
                unique.push(recipient);
            }
        }

        if unique.is_empty() {
            return Err(EnvelopeError::NoRecipients);
        }

        Ok(Self {
            message: message.into(),
            recipients: unique,
        })
    }

    #[must_use]
    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    /// Shared handle to the message, for transports that fan out.
    #[must_use]
    pub fn shared_message(&self) -> Arc<ChannelMessage> {
        Arc::clone(&self.message)
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    fn message() -> ChannelMessage {
        ChannelMessage::new(Uuid::new_v4(), Uuid::new_v4(), None, BTreeMap::new(), vec![])
    }

    fn addr(value: &str) -> Address {
        Address::parse(value).unwrap()
    }

    #[test]
    fn keeps_non_null_recipients() {
        let recipients = vec![Some(Address::loopback()), Some(addr("memory://testing")), None];
        let envelope = ChannelEnvelope::new(message(), recipients).unwrap();

        assert_eq!(
            envelope.recipients(),
            &[Address::loopback(), addr("memory://testing")]
        );
    }

    #[test]
    fn shares_the_message() {
        let message = Arc::new(message());
        let envelope = ChannelEnvelope::new(Arc::clone(&message), [Address::loopback()]).unwrap();
        assert!(Arc::ptr_eq(&envelope.shared_message(), &message));
        assert_eq!(envelope.message().message_id(), message.message_id());
    }

    #[test]
    fn empty_recipients_fail() {
        let err = ChannelEnvelope::new(message(), Vec::<Address>::new()).unwrap_err();
        assert_eq!(err, EnvelopeError::NoRecipients);
    }

    #[test]
    fn only_null_recipients_fail() {
        let err = ChannelEnvelope::new(message(), vec![None::<Address>, None]).unwrap_err();
        assert_eq!(err, EnvelopeError::NoRecipients);
    }

    proptest! {
        #[test]
        fn recipients_are_deduplicated_non_null_inputs(
            raw in proptest::collection::vec(proptest::option::of("[a-d]{1,2}"), 0..12)
        ) {
            let input: Vec<Option<Address>> = raw
                .iter()
                .map(|value| value.as_deref().map(addr))
                .collect();

            let mut expected: Vec<Address> = Vec::new();
            for value in input.iter().flatten() {
                if !expected.contains(value) {
                    expected.push(value.clone());
                }
            }

            match ChannelEnvelope::new(message(), input) {
                Ok(envelope) => prop_assert_eq!(envelope.recipients(), expected.as_slice()),
                Err(err) => {
                    prop_assert!(expected.is_empty());
                    prop_assert_eq!(err, EnvelopeError::NoRecipients);
                }
            }
        }
    }
}
