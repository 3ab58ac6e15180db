//! Error taxonomy for the bus engine.

use courier_core::{ConfigError, EnvelopeError};

/// Errors raised by channel groups, workers, channels and dispatch contexts.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A caller passed an argument that can never be valid.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    /// The call is not legal in the current lifecycle state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The transport could not be reached or dropped the connection.
    #[error("connection unavailable: {0}")]
    Connection(String),
    /// The object was torn down before the call.
    #[error("{0} has been disposed")]
    Disposed(&'static str),
    #[error("the message has already been dispatched")]
    AlreadyDispatched,
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// A message handler failed.
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Whether the failure is a connectivity problem the transport may recover from.
    ///
    /// Handler errors count when their source chain contains a connection error,
    /// so a handler that fails on a reply propagates the fault to its worker.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Handler(err) => err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<BusError>(), Some(BusError::Connection(_)))),
            _ => false,
        }
    }

    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
