//! Placement passes over one group's brokers.
//!
//! Two strategies:
//! 1. Load-balance: pooled addresses go to the broker with the fewest queues
//! 2. Fan-out: the single address of a scale-unit group goes everywhere
//!
//! Both abort on the first failed broker call. Whatever was deployed before
//! the failure stays deployed; the rest is picked up by the next pass.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use tracing::{debug, info};

use qplace_core::{Address, BrokerId};

use crate::broker::BrokerHandle;
use crate::error::{PlacementError, PlacementResult};

/// One `deploy_queue` issued by a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub broker_id: BrokerId,
    pub queue: String,
}

/// Deploy every candidate not yet live anywhere in the group onto the least
/// loaded broker, one address at a time.
///
/// Ties between equally loaded brokers go to the smallest broker id.
pub async fn balance_by_queue_count<'a>(
    group_id: &str,
    brokers: &BTreeMap<BrokerId, BrokerHandle>,
    candidates: impl IntoIterator<Item = &'a Address>,
) -> PlacementResult<Vec<Assignment>> {
    let candidates: Vec<&Address> = candidates.into_iter().collect();
    if brokers.is_empty() || candidates.is_empty() {
        return Ok(Vec::new());
    }

    // Anything already hosted by some broker of the group stays where it is.
    let mut live = BTreeSet::new();
    for (broker_id, broker) in brokers {
        let names = broker
            .queue_names()
            .await
            .map_err(|e| PlacementError::broker(broker_id, e))?;
        live.extend(names);
    }

    let pending: Vec<&Address> = candidates
        .into_iter()
        .filter(|addr| !live.contains(&addr.name))
        .collect();
    if pending.is_empty() {
        debug!(%group_id, "all addresses already placed");
        return Ok(Vec::new());
    }

    let mut by_load = BinaryHeap::with_capacity(brokers.len());
    for (broker_id, broker) in brokers {
        let count = broker
            .queue_count()
            .await
            .map_err(|e| PlacementError::broker(broker_id, e))?;
        by_load.push(Reverse((count, broker_id)));
    }

    let mut assignments = Vec::with_capacity(pending.len());
    for addr in pending {
        let Some(Reverse((count, broker_id))) = by_load.pop() else {
            break;
        };
        let broker = &brokers[broker_id];
        broker
            .deploy_queue(&addr.name)
            .await
            .map_err(|e| PlacementError::broker(broker_id, e))?;

        info!(%group_id, broker = %broker_id, queue = %addr.name, load = count + 1, "queue placed");
        assignments.push(Assignment {
            broker_id: broker_id.clone(),
            queue: addr.name.clone(),
        });
        by_load.push(Reverse((count + 1, broker_id)));
    }

    Ok(assignments)
}

/// Deploy `address` on every broker of the group that does not host it yet.
///
/// Brokers already hosting the address get no mutation, so repeating the
/// pass is a no-op once every broker has it.
pub async fn fan_out(
    group_id: &str,
    brokers: &BTreeMap<BrokerId, BrokerHandle>,
    address: &Address,
) -> PlacementResult<Vec<Assignment>> {
    let mut assignments = Vec::new();
    for (broker_id, broker) in brokers {
        let hosted = broker
            .queue_names()
            .await
            .map_err(|e| PlacementError::broker(broker_id, e))?;
        if hosted.contains(&address.name) {
            continue;
        }
        broker
            .deploy_queue(&address.name)
            .await
            .map_err(|e| PlacementError::broker(broker_id, e))?;
        assignments.push(Assignment {
            broker_id: broker_id.clone(),
            queue: address.name.clone(),
        });
    }

    if !assignments.is_empty() {
        info!(%group_id, queue = %address.name, brokers = assignments.len(), "scale-unit queue fanned out");
    }
    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::broker::BrokerError;
    use crate::fake::FakeBroker;

    fn pooled(names: &[&str]) -> Vec<Address> {
        names.iter().map(|n| Address::pooled(*n, "g")).collect()
    }

    fn group(brokers: &[(&str, &Arc<FakeBroker>)]) -> BTreeMap<BrokerId, BrokerHandle> {
        brokers
            .iter()
            .map(|(id, b)| (id.to_string(), Arc::clone(b) as BrokerHandle))
            .collect()
    }

    #[tokio::test]
    async fn no_brokers_is_noop() {
        let brokers = BTreeMap::new();
        let addrs = pooled(&["q1"]);
        let placed = balance_by_queue_count("g", &brokers, &addrs).await.unwrap();
        assert!(placed.is_empty());
    }

    #[tokio::test]
    async fn places_on_least_loaded_broker() {
        let b1 = Arc::new(FakeBroker::with_queues(["qa", "qb"]));
        let b2 = Arc::new(FakeBroker::new());
        let brokers = group(&[("b1", &b1), ("b2", &b2)]);

        let addrs = pooled(&["qc"]);
        let placed = balance_by_queue_count("g", &brokers, &addrs).await.unwrap();

        assert_eq!(placed, vec![Assignment { broker_id: "b2".into(), queue: "qc".into() }]);
        assert!(b1.deployed().is_empty());
    }

    #[tokio::test]
    async fn skips_addresses_live_on_any_broker() {
        let b1 = Arc::new(FakeBroker::with_queues(["qa"]));
        let b2 = Arc::new(FakeBroker::new());
        let brokers = group(&[("b1", &b1), ("b2", &b2)]);

        let addrs = pooled(&["qa", "qb"]);
        let placed = balance_by_queue_count("g", &brokers, &addrs).await.unwrap();

        assert_eq!(placed.len(), 1);
        assert_eq!(b2.deployed(), vec!["qb".to_string()]);
        assert!(b1.deployed().is_empty());
    }

    #[tokio::test]
    async fn spreads_evenly_from_empty() {
        let b1 = Arc::new(FakeBroker::new());
        let b2 = Arc::new(FakeBroker::new());
        let b3 = Arc::new(FakeBroker::new());
        let brokers = group(&[("b1", &b1), ("b2", &b2), ("b3", &b3)]);

        let names: Vec<String> = (0..10).map(|i| format!("q{i}")).collect();
        let addrs: Vec<Address> = names.iter().map(|n| Address::pooled(n.clone(), "g")).collect();
        balance_by_queue_count("g", &brokers, &addrs).await.unwrap();

        let counts = [b1.queues().len(), b2.queues().len(), b3.queues().len()];
        assert_eq!(counts.iter().sum::<usize>(), 10);
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1, "uneven spread: {counts:?}");
    }

    #[tokio::test]
    async fn aborts_on_first_failure_and_keeps_earlier_deploys() {
        let b1 = Arc::new(FakeBroker::new());
        b1.fail_deploys_after(1);
        let brokers = group(&[("b1", &b1)]);

        let addrs = pooled(&["q1", "q2", "q3"]);
        let err = balance_by_queue_count("g", &brokers, &addrs).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(b1.queues().len(), 1);
    }

    #[tokio::test]
    async fn query_failure_issues_no_deploys() {
        let b1 = Arc::new(FakeBroker::new());
        let b2 = Arc::new(FakeBroker::new());
        b2.set_unresponsive(true);
        let brokers = group(&[("b1", &b1), ("b2", &b2)]);

        let addrs = pooled(&["q1"]);
        let err = balance_by_queue_count("g", &brokers, &addrs).await.unwrap_err();

        assert!(matches!(
            err,
            PlacementError::Broker { ref broker_id, source: BrokerError::Timeout(_) } if broker_id == "b2"
        ));
        assert!(b1.deployed().is_empty());
    }

    #[tokio::test]
    async fn fan_out_hits_every_broker() {
        let b1 = Arc::new(FakeBroker::new());
        let b2 = Arc::new(FakeBroker::new());
        let brokers = group(&[("b1", &b1), ("b2", &b2)]);

        let addr = Address::scale_unit("qx");
        let placed = fan_out("qx", &brokers, &addr).await.unwrap();

        assert_eq!(placed.len(), 2);
        assert_eq!(b1.deployed(), vec!["qx".to_string()]);
        assert_eq!(b2.deployed(), vec!["qx".to_string()]);
    }

    #[tokio::test]
    async fn fan_out_skips_brokers_already_hosting() {
        let b1 = Arc::new(FakeBroker::with_queues(["qx"]));
        let b2 = Arc::new(FakeBroker::new());
        let brokers = group(&[("b1", &b1), ("b2", &b2)]);

        let placed = fan_out("qx", &brokers, &Address::scale_unit("qx")).await.unwrap();

        assert_eq!(placed, vec![Assignment { broker_id: "b2".into(), queue: "qx".into() }]);
        assert!(b1.deployed().is_empty());
    }
}
