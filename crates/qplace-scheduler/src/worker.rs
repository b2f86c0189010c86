//! The single scheduling worker.
//!
//! One task owns the [`PlacementEngine`] and applies [`SchedulerEvent`]s in
//! arrival order, one placement pass at a time. Desired-state snapshots and
//! broker connect/disconnect events all go through the same queue, so no
//! two passes ever interleave and no lock is held across broker I/O.

use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use qplace_core::{Address, BrokerId, DesiredState, GroupId};
use qplace_placement::{BrokerHandle, PlacementEngine, PlacementResult};

use crate::error::{SchedulerError, SchedulerResult};

type Reply<T> = oneshot::Sender<T>;

pub enum SchedulerEvent {
    DesiredStateChanged {
        state: DesiredState,
        reply: Reply<PlacementResult<()>>,
    },
    GroupUpdated {
        group_id: GroupId,
        addresses: BTreeSet<Address>,
        reply: Reply<PlacementResult<()>>,
    },
    BrokerAdded {
        group_id: GroupId,
        broker_id: BrokerId,
        broker: BrokerHandle,
        reply: Reply<PlacementResult<()>>,
    },
    BrokerRemoved {
        group_id: GroupId,
        broker_id: BrokerId,
        reply: Reply<PlacementResult<()>>,
    },
    Inspect {
        reply: Reply<Vec<GroupSnapshot>>,
    },
}

/// Point-in-time view of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    pub desired: BTreeSet<Address>,
    pub brokers: Vec<BrokerId>,
}

pub struct Scheduler {
    engine: PlacementEngine,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Scheduler {
    /// Start the worker. It runs until every handle has been dropped.
    pub fn spawn(engine: PlacementEngine) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Scheduler { engine, events: rx };
        let task = tokio::spawn(worker.run());
        (SchedulerHandle { events: tx }, task)
    }

    async fn run(mut self) {
        debug!("scheduler worker started");
        while let Some(event) = self.events.recv().await {
            self.apply(event).await;
        }
        info!(
            groups = self.engine.group_ids().len(),
            brokers = self.engine.broker_count(),
            "scheduler worker stopped"
        );
    }

    async fn apply(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::DesiredStateChanged { state, reply } => {
                let groups = state.len();
                let result = self.engine.set_desired_state(state).await;
                if let Err(e) = &result {
                    warn!(groups, error = %e, "desired state only partly applied");
                }
                let _ = reply.send(result);
            }
            SchedulerEvent::GroupUpdated {
                group_id,
                addresses,
                reply,
            } => {
                let result = self.engine.update_group(&group_id, addresses).await;
                if let Err(e) = &result {
                    warn!(%group_id, error = %e, "group update failed");
                }
                let _ = reply.send(result);
            }
            SchedulerEvent::BrokerAdded {
                group_id,
                broker_id,
                broker,
                reply,
            } => {
                let result = self.engine.broker_added(&group_id, &broker_id, broker).await;
                if let Err(e) = &result {
                    warn!(%group_id, %broker_id, error = %e, "broker addition failed");
                }
                let _ = reply.send(result);
            }
            SchedulerEvent::BrokerRemoved {
                group_id,
                broker_id,
                reply,
            } => {
                let result = self.engine.broker_removed(&group_id, &broker_id).await;
                if let Err(e) = &result {
                    warn!(%group_id, %broker_id, error = %e, "rebalance after broker loss failed");
                }
                let _ = reply.send(result);
            }
            SchedulerEvent::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.engine
            .group_ids()
            .into_iter()
            .map(|group_id| GroupSnapshot {
                desired: self.engine.desired(&group_id).cloned().unwrap_or_default(),
                brokers: self.engine.broker_ids(&group_id),
                group_id,
            })
            .collect()
    }
}

/// Cloneable entry point to the worker. Every call waits for its event to
/// be applied.
#[derive(Clone)]
pub struct SchedulerHandle {
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub async fn set_desired_state(&self, state: DesiredState) -> SchedulerResult<()> {
        self.call(|reply| SchedulerEvent::DesiredStateChanged { state, reply })
            .await?
            .map_err(SchedulerError::from)
    }

    pub async fn update_group(
        &self,
        group_id: &str,
        addresses: BTreeSet<Address>,
    ) -> SchedulerResult<()> {
        let group_id = group_id.to_string();
        self.call(|reply| SchedulerEvent::GroupUpdated {
            group_id,
            addresses,
            reply,
        })
        .await?
        .map_err(SchedulerError::from)
    }

    /// Register a broker whose link is up.
    ///
    /// An error other than a duplicate registration comes from the
    /// placement pass that follows; the broker stays registered.
    pub async fn broker_added(
        &self,
        group_id: &str,
        broker_id: &str,
        broker: BrokerHandle,
    ) -> SchedulerResult<()> {
        let group_id = group_id.to_string();
        let broker_id = broker_id.to_string();
        self.call(|reply| SchedulerEvent::BrokerAdded {
            group_id,
            broker_id,
            broker,
            reply,
        })
        .await?
        .map_err(SchedulerError::from)
    }

    pub async fn broker_removed(&self, group_id: &str, broker_id: &str) -> SchedulerResult<()> {
        let group_id = group_id.to_string();
        let broker_id = broker_id.to_string();
        self.call(|reply| SchedulerEvent::BrokerRemoved {
            group_id,
            broker_id,
            reply,
        })
        .await?
        .map_err(SchedulerError::from)
    }

    /// Every known group with its desired set and registered brokers.
    pub async fn groups(&self) -> SchedulerResult<Vec<GroupSnapshot>> {
        self.call(|reply| SchedulerEvent::Inspect { reply }).await
    }

    async fn call<T>(
        &self,
        event: impl FnOnce(Reply<T>) -> SchedulerEvent,
    ) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(event(tx))
            .map_err(|_| SchedulerError::WorkerStopped)?;
        rx.await.map_err(|_| SchedulerError::WorkerStopped)
    }
}
