//! Placement engine: converges each group's brokers toward its desired
//! address set.
//!
//! Three kinds of event drive it:
//! 1. `set_desired_state` / `update_group` when the desired state changes
//! 2. `broker_added` when a broker finishes its link handshake
//! 3. `broker_removed` when a broker disconnects
//!
//! A group with more than one desired address is load-balanced; a group
//! with exactly one address is a scale unit and that address goes to every
//! broker of the group.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use qplace_core::{Address, BrokerId, DesiredState, GroupId};

use crate::balance::{balance_by_queue_count, fan_out};
use crate::broker::BrokerHandle;
use crate::error::{PlacementError, PlacementResult};

/// In-memory placement state: desired addresses and live brokers per group.
///
/// Nothing here is persisted. After a restart the broker map is rebuilt from
/// live connections and the desired map from the next feed snapshot.
#[derive(Default)]
pub struct PlacementEngine {
    /// Last desired set each group converged on without error.
    desired: HashMap<GroupId, BTreeSet<Address>>,
    /// Registered brokers per group, ordered by broker id for stable ties.
    brokers: HashMap<GroupId, BTreeMap<BrokerId, BrokerHandle>>,
}

impl PlacementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole desired state.
    ///
    /// Groups missing from `state` lose their bookkeeping entry but their
    /// brokers receive no delete calls. Every group in `state` goes through
    /// [`update_group`](Self::update_group); a failure in one group does not
    /// stop the others, and the first error is returned.
    pub async fn set_desired_state(&mut self, state: DesiredState) -> PlacementResult<()> {
        let stale: Vec<GroupId> = self
            .desired
            .keys()
            .filter(|group_id| !state.contains_key(*group_id))
            .cloned()
            .collect();
        for group_id in stale {
            self.desired.remove(&group_id);
            info!(%group_id, "group dropped from desired state, queues left in place");
        }

        let mut first_error = None;
        for (group_id, addresses) in state {
            if let Err(e) = self.update_group(&group_id, addresses).await {
                warn!(%group_id, error = %e, "group update failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Diff `addresses` against the group's recorded desired set and apply it.
    ///
    /// Removed addresses are deleted from every broker of the group. A
    /// multi-address group is then load-balanced over its whole desired set,
    /// which places the added addresses and anything a previous pass left
    /// unplaced; live queues are never moved. A one-address group deploys
    /// the address on every broker still missing it, which also covers a
    /// pooled group that shrank to one address. The set is recorded once the
    /// pass succeeds.
    pub async fn update_group(
        &mut self,
        group_id: &str,
        addresses: BTreeSet<Address>,
    ) -> PlacementResult<()> {
        let previous = self.desired.get(group_id).cloned().unwrap_or_default();
        let removed: Vec<&Address> = previous.difference(&addresses).collect();
        let added: Vec<&Address> = addresses.difference(&previous).collect();

        debug!(%group_id, added = added.len(), removed = removed.len(), "updating group");

        if let Some(brokers) = self.brokers.get(group_id) {
            for (broker_id, broker) in brokers {
                for addr in &removed {
                    broker
                        .delete_queue(&addr.name)
                        .await
                        .map_err(|e| PlacementError::broker(broker_id, e))?;
                    info!(%group_id, broker = %broker_id, queue = %addr.name, "queue deleted");
                }
            }

            match addresses.len() {
                0 => {}
                1 => {
                    if let Some(addr) = addresses.first() {
                        fan_out(group_id, brokers, addr).await?;
                    }
                }
                _ => {
                    balance_by_queue_count(group_id, brokers, &addresses).await?;
                }
            }
        }

        if addresses.is_empty() {
            self.desired.remove(group_id);
        } else {
            self.desired.insert(group_id.to_string(), addresses);
        }
        Ok(())
    }

    /// Register a broker that completed its handshake and place the group's
    /// addresses on it as needed.
    pub async fn broker_added(
        &mut self,
        group_id: &str,
        broker_id: &str,
        broker: BrokerHandle,
    ) -> PlacementResult<()> {
        let brokers = self.brokers.entry(group_id.to_string()).or_default();
        if brokers.contains_key(broker_id) {
            return Err(PlacementError::DuplicateRegistration {
                group_id: group_id.to_string(),
                broker_id: broker_id.to_string(),
            });
        }
        brokers.insert(broker_id.to_string(), broker.clone());
        info!(%group_id, %broker_id, brokers = brokers.len(), "broker registered");

        let Some(desired) = self.desired.get(group_id) else {
            return Ok(());
        };

        if desired.len() == 1 {
            if let Some(addr) = desired.first() {
                let newcomer = BTreeMap::from([(broker_id.to_string(), broker)]);
                fan_out(group_id, &newcomer, addr).await?;
            }
            return Ok(());
        }

        balance_by_queue_count(group_id, brokers, desired).await?;
        Ok(())
    }

    /// Deregister a broker and re-place addresses it may have been the only
    /// host of.
    pub async fn broker_removed(&mut self, group_id: &str, broker_id: &str) -> PlacementResult<()> {
        let Some(brokers) = self.brokers.get_mut(group_id) else {
            warn!(%group_id, %broker_id, "removal for unknown group ignored");
            return Ok(());
        };
        if brokers.remove(broker_id).is_none() {
            warn!(%group_id, %broker_id, "removal for unknown broker ignored");
            return Ok(());
        }
        info!(%group_id, %broker_id, brokers = brokers.len(), "broker deregistered");

        if brokers.is_empty() {
            self.brokers.remove(group_id);
            return Ok(());
        }

        if let Some(desired) = self.desired.get(group_id)
            && desired.len() > 1
        {
            let placed = balance_by_queue_count(group_id, brokers, desired).await?;
            if !placed.is_empty() {
                info!(%group_id, replaced = placed.len(), "re-placed queues after broker loss");
            }
        }
        Ok(())
    }

    /// Recorded desired set for a group.
    pub fn desired(&self, group_id: &str) -> Option<&BTreeSet<Address>> {
        self.desired.get(group_id)
    }

    pub fn broker_ids(&self, group_id: &str) -> Vec<BrokerId> {
        self.brokers
            .get(group_id)
            .map(|brokers| brokers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every group with a desired set or at least one broker.
    pub fn group_ids(&self) -> BTreeSet<GroupId> {
        self.desired
            .keys()
            .chain(self.brokers.keys())
            .cloned()
            .collect()
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::fake::FakeBroker;

    fn pooled(names: &[&str]) -> BTreeSet<Address> {
        names.iter().map(|n| Address::pooled(*n, "g1")).collect()
    }

    #[tokio::test]
    async fn engine_starts_empty() {
        let engine = PlacementEngine::new();
        assert!(engine.group_ids().is_empty());
        assert_eq!(engine.broker_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut engine = PlacementEngine::new();
        let b1 = Arc::new(FakeBroker::new());
        engine.broker_added("g1", "b1", b1.clone()).await.unwrap();

        let err = engine.broker_added("g1", "b1", b1).await.unwrap_err();
        assert!(matches!(err, PlacementError::DuplicateRegistration { .. }));
        assert_eq!(engine.broker_count(), 1);
    }

    #[tokio::test]
    async fn same_broker_id_in_other_group_is_fine() {
        let mut engine = PlacementEngine::new();
        engine.broker_added("g1", "b1", Arc::new(FakeBroker::new())).await.unwrap();
        engine.broker_added("g2", "b1", Arc::new(FakeBroker::new())).await.unwrap();
        assert_eq!(engine.broker_count(), 2);
    }

    #[tokio::test]
    async fn last_broker_removal_drops_group_entry() {
        let mut engine = PlacementEngine::new();
        engine.update_group("g1", pooled(&["qa", "qb"])).await.unwrap();
        engine.broker_added("g1", "b1", Arc::new(FakeBroker::new())).await.unwrap();

        engine.broker_removed("g1", "b1").await.unwrap();

        assert!(engine.broker_ids("g1").is_empty());
        assert_eq!(engine.desired("g1").map(BTreeSet::len), Some(2));
    }

    #[tokio::test]
    async fn unknown_removal_is_ignored() {
        let mut engine = PlacementEngine::new();
        assert!(engine.broker_removed("g1", "nobody").await.is_ok());
    }

    #[tokio::test]
    async fn removed_addresses_are_deleted_on_every_broker() {
        let mut engine = PlacementEngine::new();
        let b1 = Arc::new(FakeBroker::new());
        let b2 = Arc::new(FakeBroker::new());
        engine.broker_added("g1", "b1", b1.clone()).await.unwrap();
        engine.broker_added("g1", "b2", b2.clone()).await.unwrap();
        engine.update_group("g1", pooled(&["qa", "qb", "qc"])).await.unwrap();

        engine.update_group("g1", pooled(&["qa", "qb"])).await.unwrap();

        assert_eq!(b1.deleted(), vec!["qc".to_string()]);
        assert_eq!(b2.deleted(), vec!["qc".to_string()]);
        let all: BTreeSet<String> = b1.queues().union(&b2.queues()).cloned().collect();
        assert_eq!(all, ["qa", "qb"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn failed_pass_keeps_previous_desired_set() {
        let mut engine = PlacementEngine::new();
        let b1 = Arc::new(FakeBroker::new());
        engine.broker_added("g1", "b1", b1.clone()).await.unwrap();
        b1.set_unresponsive(true);

        assert!(engine.update_group("g1", pooled(&["qa", "qb"])).await.is_err());
        assert!(engine.desired("g1").is_none());

        b1.set_unresponsive(false);
        engine.update_group("g1", pooled(&["qa", "qb"])).await.unwrap();
        assert_eq!(b1.queues().len(), 2);
    }

    #[tokio::test]
    async fn empty_update_forgets_group() {
        let mut engine = PlacementEngine::new();
        engine.update_group("g1", pooled(&["qa"])).await.unwrap();
        engine.update_group("g1", BTreeSet::new()).await.unwrap();
        assert!(engine.group_ids().is_empty());
    }
}
