//! Shared types used across qplace crates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a colocation/scheduling group.
pub type GroupId = String;

/// Identifier of a live broker connection (the broker's container id).
pub type BrokerId = String;

/// The externally supplied target mapping: group → desired addresses.
pub type DesiredState = BTreeMap<GroupId, BTreeSet<Address>>;

/// How an address is placed inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressPolicy {
    /// Shareable queue, load-balanced across the group's brokers.
    Pooled,
    /// Sole address of its group, replicated on every broker of the group.
    ScaleUnit,
}

/// A queue to be placed on some broker of its group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub group_id: GroupId,
    pub policy: AddressPolicy,
}

impl Address {
    pub fn pooled(name: impl Into<String>, group_id: impl Into<GroupId>) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
            policy: AddressPolicy::Pooled,
        }
    }

    /// A scale-unit address is grouped under its own name.
    pub fn scale_unit(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            group_id: name.clone(),
            name,
            policy: AddressPolicy::ScaleUnit,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.policy == AddressPolicy::Pooled
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.name)
    }
}

/// Host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_unit_is_its_own_group() {
        let addr = Address::scale_unit("orders");
        assert_eq!(addr.group_id, "orders");
        assert!(!addr.is_pooled());
    }

    #[test]
    fn address_serializes_policy_in_snake_case() {
        let addr = Address::scale_unit("q1");
        let json = serde_json::to_string(&addr).unwrap();
        assert!(json.contains("\"scale_unit\""));
    }

    #[test]
    fn desired_state_orders_addresses_by_name() {
        let mut state = DesiredState::new();
        let set = state.entry("pooled-inmemory".to_string()).or_default();
        set.insert(Address::pooled("q2", "pooled-inmemory"));
        set.insert(Address::pooled("q1", "pooled-inmemory"));

        let names: Vec<_> = state["pooled-inmemory"].iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["q1", "q2"]);
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("messaging", 5672).to_string(), "messaging:5672");
    }
}
