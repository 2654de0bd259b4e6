//! Bounded polling of a remote instance's lifecycle state.

use crate::clock::{self, Clock};
use privcloud_common::{LifecycleState, ProvisioningError};
use privcloud_providers::{inventory::DiscoveredInstance, is_not_found, CloudProvider, InstanceFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Which states end a wait, and how.
#[derive(Debug, Clone, Copy)]
pub struct Expectation {
    pub operation: &'static str,
    pub accept: &'static [LifecycleState],
    pub terminal: &'static [LifecycleState],
}

pub const RUNNING: Expectation = Expectation {
    operation: "await_running",
    accept: &[LifecycleState::Running],
    terminal: &[
        LifecycleState::Stopping,
        LifecycleState::ShuttingDown,
        LifecycleState::Stopped,
        LifecycleState::Terminated,
    ],
};

pub const STOPPED: Expectation = Expectation {
    operation: "await_stopped",
    accept: &[LifecycleState::Stopped, LifecycleState::Terminated],
    terminal: &[],
};

#[derive(Clone)]
pub struct LifecyclePoller {
    provider: Arc<dyn CloudProvider>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl LifecyclePoller {
    pub fn new(provider: Arc<dyn CloudProvider>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            provider,
            clock,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetch, classify, sleep; until an accepted state, a terminal state or the deadline.
    ///
    /// "Not found" (or an empty answer) counts as still in flight.
    pub async fn await_state(
        &self,
        instance_id: &str,
        expect: &Expectation,
        deadline: Instant,
    ) -> Result<DiscoveredInstance, ProvisioningError> {
        let filter = InstanceFilter::by_id(instance_id);
        let mut last_seen: Option<LifecycleState> = None;

        while self.clock.now() < deadline {
            match self.provider.describe_instances(&filter).await {
                Ok(found) => {
                    if let Some(instance) = found.into_iter().find(|i| i.instance_id == instance_id) {
                        if expect.accept.contains(&instance.state) {
                            return Ok(instance);
                        }
                        if expect.terminal.contains(&instance.state) {
                            return Err(ProvisioningError::UnexpectedTerminalState {
                                resource_id: instance_id.to_string(),
                                state: instance.state,
                            });
                        }
                        last_seen = Some(instance.state);
                    }
                }
                Err(e) if is_not_found(&e) => {
                    tracing::debug!("[poller] {} not visible yet", instance_id);
                }
                Err(e) => return Err(ProvisioningError::remote("describe_instances", e)),
            }

            let Some(left) = clock::remaining(self.clock.as_ref(), deadline) else {
                break;
            };
            self.clock.sleep(self.interval.min(left)).await;
        }

        let resource = match last_seen {
            Some(state) => format!("{} last seen {}", instance_id, state),
            None => format!("{} never observed", instance_id),
        };
        Err(ProvisioningError::timeout(expect.operation, resource))
    }

    /// Wait for a freshly created instance; the provider needs a moment before
    /// it reports anything, so the first fetch comes after one interval.
    pub async fn await_running_after_create(
        &self,
        instance_id: &str,
        deadline: Instant,
    ) -> Result<DiscoveredInstance, ProvisioningError> {
        if let Some(left) = clock::remaining(self.clock.as_ref(), deadline) {
            self.clock.sleep(self.interval.min(left)).await;
        }
        self.await_state(instance_id, &RUNNING, deadline).await
    }

    pub async fn await_stopped(
        &self,
        instance_id: &str,
        deadline: Instant,
    ) -> Result<DiscoveredInstance, ProvisioningError> {
        self.await_state(instance_id, &STOPPED, deadline).await
    }
}
