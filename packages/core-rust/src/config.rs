//! Channel group configuration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::ConfigError;

/// How a transport scopes the acknowledgement of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Deliveries are acknowledged on receipt; sends go out immediately.
    #[default]
    None,
    /// Deliveries are acknowledged on commit and requeued on rollback.
    Acknowledge,
    /// Like `Acknowledge`, and sends are buffered until commit.
    Full,
}

/// Static configuration of one channel group.
///
/// Read-only once handed to a group. Timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelGroupConfig {
    /// Unique name of the group; also the default input queue.
    pub group_name: String,
    /// Dispatch-only groups never receive.
    pub dispatch_only: bool,
    /// Synchronous dispatch-only groups share pooled channels.
    pub synchronous: bool,
    /// Number of receive workers (and connections) started per group.
    pub min_workers: usize,
    /// Upper bound on workers. Accepted and validated; pools run at `min_workers`.
    pub max_workers: usize,
    /// Upper bound on a single receive call.
    pub receive_timeout_ms: u64,
    pub transaction_mode: TransactionMode,
    /// Failed attempts after which a delivery is poisoned. `0` disables poisoning.
    pub max_attempts: u32,
    /// Destination for poisoned messages.
    pub poison_address: Option<Address>,
    /// Queue to receive from. Defaults to `group_name`.
    pub input_queue: Option<String>,
    /// Address stamped on outbound messages so replies come back to this group.
    pub return_address: Option<Address>,
}

impl Default for ChannelGroupConfig {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            dispatch_only: false,
            synchronous: false,
            min_workers: 1,
            max_workers: 1,
            receive_timeout_ms: 1_500,
            transaction_mode: TransactionMode::default(),
            max_attempts: 3,
            poison_address: None,
            input_queue: None,
            return_address: None,
        }
    }
}

impl ChannelGroupConfig {
    /// Shorthand for a group with defaults and the given name.
    #[must_use]
    pub fn named(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Self::default()
        }
    }

    /// Checks the invariants a channel group relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule: empty name, zero `min_workers`,
    /// `max_workers < min_workers`, or a zero receive timeout on a
    /// receiving group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_name.trim().is_empty() {
            return Err(ConfigError::MissingGroupName);
        }
        if self.min_workers == 0 {
            return Err(ConfigError::MinWorkers {
                group: self.group_name.clone(),
            });
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::MaxWorkers {
                group: self.group_name.clone(),
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if !self.dispatch_only && self.receive_timeout_ms == 0 {
            return Err(ConfigError::ReceiveTimeout {
                group: self.group_name.clone(),
            });
        }
        Ok(())
    }

    /// Whether outbound sends go through a shared channel pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.dispatch_only && self.synchronous
    }

    /// The queue a receiving group listens on.
    #[must_use]
    pub fn input_queue(&self) -> &str {
        self.input_queue.as_deref().unwrap_or(&self.group_name)
    }
}

/// The set of channel groups a process hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub groups: Vec<ChannelGroupConfig>,
}

impl BusConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON, the group's own
    /// validation error, or `ConfigError::DuplicateGroup`.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every group and rejects duplicate names.
    ///
    /// # Errors
    ///
    /// See [`BusConfig::from_json_str`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(group.group_name.as_str()) {
                return Err(ConfigError::DuplicateGroup(group.group_name.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&ChannelGroupConfig> {
        self.groups.iter().find(|g| g.group_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_named() {
        let config = ChannelGroupConfig::named("orders");
        assert!(config.validate().is_ok());
        assert_eq!(config.input_queue(), "orders");
        assert!(!config.is_pooled());
    }

    #[test]
    fn validate_rejects_bad_worker_counts() {
        let mut config = ChannelGroupConfig::named("orders");
        config.min_workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::MinWorkers { .. })));

        config.min_workers = 4;
        config.max_workers = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaxWorkers { min: 4, max: 2, .. })
        ));
    }

    #[test]
    fn validate_requires_name_and_receive_timeout() {
        assert!(matches!(
            ChannelGroupConfig::default().validate(),
            Err(ConfigError::MissingGroupName)
        ));

        let mut config = ChannelGroupConfig::named("orders");
        config.receive_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ReceiveTimeout { .. })));

        config.dispatch_only = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pooled_requires_dispatch_only_and_synchronous() {
        let mut config = ChannelGroupConfig::named("outbound");
        config.synchronous = true;
        assert!(!config.is_pooled());
        config.dispatch_only = true;
        assert!(config.is_pooled());
    }

    #[test]
    fn bus_config_loads_json() {
        let config = BusConfig::from_json_str(
            r#"{
                "groups": [
                    { "group_name": "orders", "min_workers": 3, "max_workers": 3,
                      "transaction_mode": "full", "poison_address": "orders.poison" },
                    { "group_name": "outbound", "dispatch_only": true, "synchronous": true }
                ]
            }"#,
        )
        .unwrap();

        let orders = config.group("orders").unwrap();
        assert_eq!(orders.min_workers, 3);
        assert_eq!(orders.transaction_mode, TransactionMode::Full);
        assert_eq!(orders.poison_address.as_ref().unwrap().as_str(), "orders.poison");
        assert_eq!(orders.max_attempts, 3);
        assert!(config.group("outbound").unwrap().is_pooled());
    }

    #[test]
    fn bus_config_rejects_duplicates() {
        let err = BusConfig::from_json_str(
            r#"{ "groups": [ { "group_name": "a" }, { "group_name": "a" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateGroup(name) if name == "a"));
    }

    #[test]
    fn bus_config_rejects_bad_addresses() {
        let err = BusConfig::from_json_str(
            r#"{ "groups": [ { "group_name": "a", "poison_address": "" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
