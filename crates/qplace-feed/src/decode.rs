//! Address snapshot decoding and grouping.

use serde::{Deserialize, Serialize};

use qplace_core::{Address, DesiredState};

/// Only records of this type are scheduled onto brokers.
pub const QUEUE_TYPE: &str = "queue";

/// Plans with this prefix share brokers with every other address on the plan.
pub const POOLED_PLAN_PREFIX: &str = "pooled";

/// One address as published by the configuration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub plan: String,
}

impl AddressRecord {
    pub fn queue(name: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: QUEUE_TYPE.to_string(),
            plan: plan.into(),
        }
    }
}

/// Decode one feed line: a JSON array of address records.
pub fn decode_snapshot(line: &str) -> serde_json::Result<DesiredState> {
    let records: Vec<AddressRecord> = serde_json::from_str(line)?;
    Ok(group_addresses(records))
}

/// Group queue records by scheduling key.
///
/// Pooled queues are keyed by their plan name, every other queue by its
/// own name. Records of other types are dropped.
pub fn group_addresses(records: impl IntoIterator<Item = AddressRecord>) -> DesiredState {
    let mut state = DesiredState::new();
    for record in records {
        if record.kind != QUEUE_TYPE {
            continue;
        }
        let address = if record.plan.starts_with(POOLED_PLAN_PREFIX) {
            Address::pooled(record.name, record.plan)
        } else {
            Address::scale_unit(record.name)
        };
        state
            .entry(address.group_id.clone())
            .or_default()
            .insert(address);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn pooled_queues_share_their_plan_group() {
        let state = group_addresses([
            AddressRecord::queue("q1", "pooled-inmemory"),
            AddressRecord::queue("q2", "pooled-inmemory"),
            AddressRecord::queue("q3", "pooled-persisted"),
        ]);

        assert_eq!(state.len(), 2);
        assert_eq!(
            state["pooled-inmemory"],
            BTreeSet::from([
                Address::pooled("q1", "pooled-inmemory"),
                Address::pooled("q2", "pooled-inmemory"),
            ])
        );
        assert_eq!(state["pooled-persisted"].len(), 1);
    }

    #[test]
    fn other_queues_are_their_own_group() {
        let state = group_addresses([
            AddressRecord::queue("orders", "sharded-queue"),
            AddressRecord::queue("audit", ""),
        ]);

        assert_eq!(state["orders"], BTreeSet::from([Address::scale_unit("orders")]));
        assert_eq!(state["audit"], BTreeSet::from([Address::scale_unit("audit")]));
    }

    #[test]
    fn non_queue_records_are_ignored() {
        let state = decode_snapshot(
            r#"[{"name":"t1","type":"topic","plan":"pooled-topic"},
                {"name":"a1","type":"anycast","plan":"standard"},
                {"name":"q1","type":"queue","plan":"pooled-inmemory"}]"#,
        )
        .unwrap();

        assert_eq!(state.len(), 1);
        assert!(state.contains_key("pooled-inmemory"));
    }

    #[test]
    fn missing_plan_defaults_to_scale_unit() {
        let state = decode_snapshot(r#"[{"name":"q1","type":"queue"}]"#).unwrap();
        assert!(!state["q1"].iter().next().unwrap().is_pooled());
    }

    #[test]
    fn empty_snapshot_is_empty_state() {
        assert!(decode_snapshot("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_snapshot_is_an_error() {
        assert!(decode_snapshot("{\"name\":\"q1\"}").is_err());
        assert!(decode_snapshot("not json").is_err());
    }
}
