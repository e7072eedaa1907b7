//! Wait for a node to reach a target status.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConvergeConfig;
use crate::error::{ConvergeError, Result};
use crate::node::{NodeHandle, NodeStatus};
use crate::provider::NodeStatusSource;
use crate::retry::RetryablePredicate;

/// The status to wait for, plus the statuses that make waiting pointless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTarget {
    target: NodeStatus,
    disqualifying: Vec<NodeStatus>,
}

impl ConvergenceTarget {
    pub fn new(target: NodeStatus) -> Self {
        Self {
            target,
            disqualifying: Vec::new(),
        }
    }

    /// Fail at once if this status is observed.
    pub fn disqualify(mut self, status: NodeStatus) -> Self {
        if status != self.target && !self.disqualifying.contains(&status) {
            self.disqualifying.push(status);
        }
        self
    }

    /// RUNNING; TERMINATED and ERROR fail fast.
    pub fn running() -> Self {
        Self::new(NodeStatus::Running)
            .disqualify(NodeStatus::Terminated)
            .disqualify(NodeStatus::Error)
    }

    /// SUSPENDED; TERMINATED and ERROR fail fast.
    pub fn suspended() -> Self {
        Self::new(NodeStatus::Suspended)
            .disqualify(NodeStatus::Terminated)
            .disqualify(NodeStatus::Error)
    }

    pub fn terminated() -> Self {
        Self::new(NodeStatus::Terminated)
    }

    pub fn target(&self) -> NodeStatus {
        self.target
    }

    pub fn is_reached(&self, status: NodeStatus) -> bool {
        status == self.target
    }

    pub fn is_disqualified(&self, status: NodeStatus) -> bool {
        self.disqualifying.contains(&status)
    }
}

/// Polls a node through its provider until it converges on a [`ConvergenceTarget`].
///
/// Each tick refreshes the node and writes the new snapshot into the shared
/// handle before evaluating it, so other holders of the handle see every
/// observed state. One refresh is in flight at a time.
pub struct StatusConvergence<S> {
    source: Arc<S>,
    target: ConvergenceTarget,
    timeout: Duration,
    period: Duration,
}

impl<S: NodeStatusSource> StatusConvergence<S> {
    pub fn new(source: Arc<S>, target: ConvergenceTarget, config: &ConvergeConfig) -> Self {
        Self {
            source,
            target,
            timeout: config.node_running_timeout(),
            period: config.poll_period(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn target(&self) -> &ConvergenceTarget {
        &self.target
    }

    /// Returns the same handle once its status matches the target.
    ///
    /// A handle that already matches returns without a remote call.
    pub async fn apply(&self, handle: &NodeHandle) -> Result<NodeHandle> {
        let start = Instant::now();
        let current = handle.status();
        if self.target.is_reached(current) {
            return Ok(handle.clone());
        }
        if self.target.is_disqualified(current) {
            return Err(self.disqualified(handle, current, start));
        }

        debug!(
            node_id = %handle.id(),
            target = %self.target.target,
            timeout_secs = self.timeout.as_secs(),
            "Waiting for node status"
        );

        let retry = RetryablePredicate::new(self.timeout, self.period);
        let reached = retry
            .apply::<_, _, ConvergeError>(move || async move {
                let Some(snapshot) = self.source.refresh_node(handle.id()).await? else {
                    warn!(node_id = %handle.id(), "Node disappeared while polling");
                    return Err(ConvergeError::ResourceDisappeared {
                        id: handle.id().to_string(),
                        target: self.target.target.to_string(),
                    });
                };

                let status = snapshot.status;
                handle.update(snapshot);
                debug!(node_id = %handle.id(), status = %status, "Polled node");

                if self.target.is_reached(status) {
                    return Ok(true);
                }
                if self.target.is_disqualified(status) {
                    return Err(self.disqualified(handle, status, start));
                }
                Ok(false)
            })
            .await?;

        if reached {
            info!(
                node_id = %handle.id(),
                status = %self.target.target,
                elapsed_secs = start.elapsed().as_secs(),
                "Node reached target status"
            );
            return Ok(handle.clone());
        }

        let last_status = handle.status();
        if self.target.is_disqualified(last_status) {
            return Err(self.disqualified(handle, last_status, start));
        }
        Err(ConvergeError::Timeout {
            id: handle.id().to_string(),
            target: self.target.target,
            max_wait_secs: self.timeout.as_secs(),
            last_status,
        })
    }

    fn disqualified(&self, handle: &NodeHandle, status: NodeStatus, start: Instant) -> ConvergeError {
        warn!(
            node_id = %handle.id(),
            status = %status,
            target = %self.target.target,
            "Node entered a disqualifying status"
        );
        ConvergeError::Disqualified {
            id: handle.id().to_string(),
            status,
            target: self.target.target,
            elapsed_secs: start.elapsed().as_secs(),
        }
    }
}
