use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Destination of an envelope: a queue, exchange or endpoint name understood
/// by the transport.
///
/// The string is opaque to the engine; interpreting schemes and hosts is the
/// transport's business. The only rules enforced here are that the address is
/// non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Well-known address that loops a message back to the sending group.
    pub const LOOPBACK: &'static str = "loopback://";

    /// Parses an address.
    ///
    /// # Errors
    ///
    /// Returns `AddressError::Empty` for an empty string and
    /// `AddressError::Whitespace` if the input contains whitespace.
    pub fn parse(value: impl Into<String>) -> Result<Self, AddressError> {
        let value = value.into();
        if value.is_empty() {
            return Err(AddressError::Empty);
        }
        if value.chars().any(char::is_whitespace) {
            return Err(AddressError::Whitespace(value));
        }
        Ok(Self(value))
    }

    /// The loopback address.
    #[must_use]
    pub fn loopback() -> Self {
        Self(Self::LOOPBACK.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for Address {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}
