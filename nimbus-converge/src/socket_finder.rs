//! Find the first reachable address of a node on a given port.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result};
use crate::node::{NodeHandle, NodeSnapshot, NodeStatus};
use crate::provider::NodeStatusSource;
use crate::retry::RetryablePredicate;
use crate::socket::{HostAndPort, ReachabilityProbe, SocketOpenTester};

/// Decides whether a node is still worth probing.
pub type LivenessCheck = Arc<dyn Fn(&NodeSnapshot) -> bool + Send + Sync>;

/// Races reachability probes across every address of a node.
///
/// Each tick probes all candidates concurrently and finishes as soon as one
/// succeeds or all have failed. Ticks never overlap. Before every tick the
/// node is refreshed through the status source (when one is set) and the
/// latest snapshot goes through the liveness check, so a node that has died
/// aborts the search instead of running out the clock.
pub struct ConcurrentOpenSocketFinder<P = SocketOpenTester> {
    probe: Arc<P>,
    period: Duration,
    liveness: LivenessCheck,
    status_source: Option<Arc<dyn NodeStatusSource>>,
}

impl<P: ReachabilityProbe + 'static> ConcurrentOpenSocketFinder<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
            period: Duration::from_secs(1),
            liveness: Arc::new(|snapshot: &NodeSnapshot| !snapshot.status.is_terminal()),
            status_source: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Replace the default check (status is not TERMINATED or ERROR).
    pub fn with_liveness<F>(mut self, liveness: F) -> Self
    where
        F: Fn(&NodeSnapshot) -> bool + Send + Sync + 'static,
    {
        self.liveness = Arc::new(liveness);
        self
    }

    /// Refresh the node from `source` before every tick. Without a source the
    /// liveness check only sees what other holders write into the handle.
    pub fn with_status_source(mut self, source: Arc<dyn NodeStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    /// Returns the first candidate that accepted a connection.
    pub async fn find_open_socket(
        &self,
        node: &NodeHandle,
        port: u16,
        timeout: Duration,
    ) -> Result<HostAndPort> {
        let snapshot = node.snapshot();
        let candidates: Vec<HostAndPort> = snapshot
            .addresses()
            .into_iter()
            .map(|addr| HostAndPort::new(addr.to_string(), port))
            .collect();

        if candidates.is_empty() {
            return Err(ConvergeError::Configuration(format!(
                "node {} has no public or private addresses to probe on port {}",
                node.id(),
                port
            )));
        }

        debug!(
            node_id = %node.id(),
            port,
            candidates = candidates.len(),
            "Searching for open socket"
        );

        let start = Instant::now();
        let candidates = &candidates;
        let retry = RetryablePredicate::new(timeout, self.period);

        let found = retry
            .poll::<_, _, _, ConvergeError>(move || async move {
                self.check_alive(node, start).await?;
                Ok(self.probe_round(candidates).await)
            })
            .await?;

        match found {
            Some(open) => {
                info!(node_id = %node.id(), socket = %open, "Found open socket");
                Ok(open)
            }
            None => Err(ConvergeError::SocketNotFound {
                port,
                node_id: node.id().to_string(),
                max_wait_secs: timeout.as_secs(),
            }),
        }
    }

    /// Refresh the handle if a status source is set, then apply the liveness check.
    async fn check_alive(&self, node: &NodeHandle, start: Instant) -> Result<()> {
        if let Some(source) = &self.status_source {
            let Some(fresh) = source.refresh_node(node.id()).await? else {
                warn!(node_id = %node.id(), "Node disappeared while searching for open socket");
                return Err(ConvergeError::ResourceDisappeared {
                    id: node.id().to_string(),
                    target: "open socket".to_string(),
                });
            };
            node.update(fresh);
        }

        let current = node.snapshot();
        if (self.liveness)(&current) {
            return Ok(());
        }
        warn!(
            node_id = %node.id(),
            status = %current.status,
            "Node is no longer alive, aborting socket search"
        );
        Err(ConvergeError::Disqualified {
            id: node.id().to_string(),
            status: current.status,
            target: NodeStatus::Running,
            elapsed_secs: start.elapsed().as_secs(),
        })
    }

    /// One tick: probe all candidates, return the first that connects.
    async fn probe_round(&self, candidates: &[HostAndPort]) -> Option<HostAndPort> {
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let probe = Arc::clone(&self.probe);
            let candidate = candidate.clone();
            tasks.spawn(async move {
                if probe.probe(&candidate).await {
                    Some(candidate)
                } else {
                    None
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(open)) => {
                    // Slower probes are abandoned.
                    tasks.abort_all();
                    return Some(open);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Socket probe task failed"),
            }
        }
        None
    }
}
