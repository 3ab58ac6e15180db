//! Transports that implement the channel contract.
//!
//! Only the in-process broker ships with the engine; wire transports live in
//! their own crates and plug in through [`crate::ChannelConnector`].

pub mod memory;

pub use memory::{MemoryBroker, MemoryChannel, MemoryConnector};
