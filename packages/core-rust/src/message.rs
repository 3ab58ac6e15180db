//! Channel messages and the logical payloads they carry.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::address::Address;

/// Well-known header names written and read by the engine.
pub mod headers {
    /// RFC 3339 timestamp of the original dispatch.
    pub const AUDIT_DISPATCHED: &str = "x-audit-dispatched";
    /// Lower-cased host name of the dispatching process.
    pub const AUDIT_ORIGIN_HOST: &str = "x-audit-origin-host";
    /// Number of failed delivery attempts before the message was poisoned.
    pub const POISON_ATTEMPTS: &str = "x-poison-attempts";
    /// Error text of the last failed attempt.
    pub const POISON_REASON: &str = "x-poison-reason";
    /// Channel group whose consumer failed.
    pub const POISON_SOURCE_GROUP: &str = "x-poison-source-group";
    /// Comma-separated type names of the logical payloads, for replay tooling.
    pub const POISON_PAYLOAD_TYPES: &str = "x-poison-payload-types";
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A type-erased logical message.
///
/// Cloning is cheap: the value is shared behind an `Arc`. The static type
/// name is kept next to the value so diagnostics can name the payload
/// without downcasting it.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    pub fn new<M: Any + Send + Sync>(message: M) -> Self {
        Self {
            value: Arc::new(message),
            type_name: std::any::type_name::<M>(),
        }
    }

    /// `TypeId` of the concrete message.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.value.as_ref().type_id()
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn is<M: Any>(&self) -> bool {
        self.value.as_ref().is::<M>()
    }

    #[must_use]
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.value.as_ref().downcast_ref::<M>()
    }

    /// Returns a shared handle to the concrete message, if it has type `M`.
    #[must_use]
    pub fn downcast_arc<M: Any + Send + Sync>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.value).downcast::<M>().ok()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.type_name).finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelMessage
// ---------------------------------------------------------------------------

/// The unit handed to a channel: identifiers, routing metadata, headers and
/// the ordered logical payloads.
///
/// A message is built once per logical dispatch. After it is wrapped in an
/// envelope it is shared immutably; a receiving transport hands consumers an
/// owned copy, which auditors may normalise (see [`ChannelMessage::set_dispatched`]).
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    message_id: Uuid,
    correlation_id: Uuid,
    return_address: Option<Address>,
    headers: BTreeMap<String, String>,
    messages: Vec<Payload>,
    dispatched: DateTime<Utc>,
    expiration: Option<DateTime<Utc>>,
    persistent: bool,
}

impl ChannelMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(
        message_id: Uuid,
        correlation_id: Uuid,
        return_address: Option<Address>,
        headers: BTreeMap<String, String>,
        messages: Vec<Payload>,
    ) -> Self {
        Self {
            message_id,
            correlation_id,
            return_address,
            headers,
            messages,
            dispatched: Utc::now(),
            expiration: None,
            persistent: false,
        }
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    #[must_use]
    pub fn return_address(&self) -> Option<&Address> {
        self.return_address.as_ref()
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.headers
    }

    #[must_use]
    pub fn messages(&self) -> &[Payload] {
        &self.messages
    }

    #[must_use]
    pub fn dispatched(&self) -> DateTime<Utc> {
        self.dispatched
    }

    /// Overrides the dispatch timestamp, e.g. with the origin time carried in
    /// a header once the message has crossed a transport.
    pub fn set_dispatched(&mut self, dispatched: DateTime<Utc>) {
        self.dispatched = dispatched;
    }

    #[must_use]
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Whether the message has passed its expiration at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Comma-separated payload type names.
    #[must_use]
    pub fn payload_types(&self) -> String {
        self.messages
            .iter()
            .map(Payload::type_name)
            .collect::<Vec<_>>()
            .join(",")
    }
}
