//! In-memory broker for placement tests.
//!
//! Keeps a queue set and a log of every call. Failures can be injected to
//! exercise the abort-on-error path of a pass.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::broker::{Broker, BrokerError, BrokerResult};

/// A call observed by a [`FakeBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Deploy(String),
    Delete(String),
    QueueCount,
    QueueNames,
}

#[derive(Debug, Default)]
struct FakeState {
    queues: BTreeSet<String>,
    calls: Vec<BrokerCall>,
    /// Remaining deploys that succeed before every further deploy times out.
    deploys_before_failure: Option<usize>,
    unresponsive: bool,
}

#[derive(Debug, Default)]
pub struct FakeBroker {
    state: Mutex<FakeState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that already hosts `names`.
    pub fn with_queues<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        broker.lock().queues = names.into_iter().map(Into::into).collect();
        broker
    }

    /// Let `n` more deploys succeed, then time out every deploy after that.
    pub fn fail_deploys_after(&self, n: usize) {
        self.lock().deploys_before_failure = Some(n);
    }

    /// Make every call time out.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    pub fn queues(&self) -> BTreeSet<String> {
        self.lock().queues.clone()
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    /// Names passed to successful or failed `deploy_queue` calls, in order.
    pub fn deployed(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::Deploy(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::Delete(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of deploy and delete calls seen so far.
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, BrokerCall::Deploy(_) | BrokerCall::Delete(_)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake broker lock")
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn deploy_queue(&self, name: &str) -> BrokerResult<()> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::Deploy(name.to_string()));
        if state.unresponsive {
            return Err(BrokerError::Timeout(format!("deployQueue {name}")));
        }
        if let Some(remaining) = state.deploys_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(BrokerError::Timeout(format!("deployQueue {name}")));
            }
            *remaining -= 1;
        }
        state.queues.insert(name.to_string());
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::Delete(name.to_string()));
        if state.unresponsive {
            return Err(BrokerError::Timeout(format!("deleteQueue {name}")));
        }
        state.queues.remove(name);
        Ok(())
    }

    async fn queue_count(&self) -> BrokerResult<usize> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::QueueCount);
        if state.unresponsive {
            return Err(BrokerError::Timeout("queueCount".to_string()));
        }
        Ok(state.queues.len())
    }

    async fn queue_names(&self) -> BrokerResult<BTreeSet<String>> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::QueueNames);
        if state.unresponsive {
            return Err(BrokerError::Timeout("getQueueNames".to_string()));
        }
        Ok(state.queues.clone())
    }
}
