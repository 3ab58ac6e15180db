//! Channel decorator composition: wraps a physical channel in the configured
//! decorator layers.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::audit::AuditLayer;
use super::resolver::ResolverLayer;
use super::traits::{DependencyResolver, MessageAuditor, MessagingChannel};

/// The decorators applied to every channel a group opens.
///
/// Layer order (outermost to innermost):
/// 1. `AuditLayer` -- auditors see the delivery after the resolver scope exists
///    and register post-commit hooks on sends
/// 2. `ResolverLayer` -- opens a nested resolver scope per delivery
///
/// Layers without collaborators pass the channel through unchanged.
#[derive(Clone, Default)]
pub struct ChannelStack {
    auditors: Vec<Arc<dyn MessageAuditor>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
}

impl ChannelStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_auditor(mut self, auditor: Arc<dyn MessageAuditor>) -> Self {
        self.auditors.push(auditor);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auditors.is_empty() && self.resolver.is_none()
    }

    #[must_use]
    pub fn decorate(&self, channel: Arc<dyn MessagingChannel>) -> Arc<dyn MessagingChannel> {
        ServiceBuilder::new()
            .layer(AuditLayer::new(self.auditors.clone()))
            .layer(ResolverLayer::new(self.resolver.clone()))
            .service(channel)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
