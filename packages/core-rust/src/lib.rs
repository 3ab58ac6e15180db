//! Courier core: addresses, channel messages, envelopes and group configuration.

pub mod address;
pub mod config;
pub mod envelope;
pub mod error;
pub mod message;

pub use address::Address;
pub use config::{BusConfig, ChannelGroupConfig, TransactionMode};
pub use envelope::ChannelEnvelope;
pub use error::{AddressError, ConfigError, EnvelopeError};
pub use message::{headers, ChannelMessage, Payload};
