//! Node provisioning: create, wait for RUNNING, wait for the login port.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cleanup::IncidentalResources;
use crate::config::ConvergeConfig;
use crate::connection::{with_retry, BackoffPolicy, ShellConnector, ShellSession};
use crate::convergence::{ConvergenceTarget, StatusConvergence};
use crate::error::{ConvergeError, Result};
use crate::key_pair::{KeyPair, KeyPairApi, KeyPairCache};
use crate::node::NodeHandle;
use crate::provider::{NodeProvider, NodeRequest, NodeStatusSource};
use crate::security_group::{SecurityGroupApi, SecurityGroupCache};
use crate::socket::{HostAndPort, ReachabilityProbe, SocketOpenTester};
use crate::socket_finder::ConcurrentOpenSocketFinder;

/// A node that is RUNNING and accepting connections on its login port.
#[derive(Debug, Clone)]
pub struct ProvisionedNode {
    pub handle: NodeHandle,
    pub login: HostAndPort,
    pub security_group_id: String,
    pub key_pair: KeyPair,
}

/// Drives node creation and teardown for a group.
pub struct Provisioner<P, G: SecurityGroupApi, K: KeyPairApi, R = SocketOpenTester> {
    provider: Arc<P>,
    security_groups: Arc<SecurityGroupCache<G>>,
    key_pairs: Arc<KeyPairCache<K>>,
    finder: Arc<ConcurrentOpenSocketFinder<R>>,
    incidental: IncidentalResources<G, K>,
    connector: Option<Arc<dyn ShellConnector>>,
    config: ConvergeConfig,
}

impl<P, G, K, R> Provisioner<P, G, K, R>
where
    P: NodeProvider + 'static,
    G: SecurityGroupApi,
    K: KeyPairApi,
    R: ReachabilityProbe + 'static,
{
    pub fn new(
        provider: Arc<P>,
        security_groups: Arc<SecurityGroupCache<G>>,
        key_pairs: Arc<KeyPairCache<K>>,
        finder: ConcurrentOpenSocketFinder<R>,
        config: ConvergeConfig,
    ) -> Self {
        let incidental =
            IncidentalResources::new(Arc::clone(&security_groups), Arc::clone(&key_pairs), &config);
        // The finder refreshes nodes through the same provider so a node that
        // dies while its port is awaited fails fast.
        let status_source: Arc<dyn NodeStatusSource> = provider.clone();
        let finder = finder.with_status_source(status_source);
        Self {
            provider,
            security_groups,
            key_pairs,
            finder: Arc::new(finder),
            incidental,
            connector: None,
            config,
        }
    }

    /// Open a login session on each node once its port is reachable.
    pub fn with_login(mut self, connector: Arc<dyn ShellConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn incidental_resources(&self) -> &IncidentalResources<G, K> {
        &self.incidental
    }

    /// Create `count` nodes in the request's group.
    ///
    /// Fails as a whole only if the group's security group or key pair cannot
    /// be materialized. After that every node is independent: the returned
    /// vector holds one outcome per node, in creation order.
    pub async fn create_nodes(
        &self,
        request: &NodeRequest,
        count: usize,
    ) -> Result<Vec<Result<ProvisionedNode>>> {
        if request.group.is_empty() {
            return Err(ConvergeError::Configuration("node group must not be empty".to_string()));
        }

        let security_group_id = self
            .security_groups
            .get(&request.region, &request.group, &request.inbound_ports)
            .await?
            .id;
        let key_pair = self.key_pairs.get(&request.region, &request.group).await?;

        info!(
            region = %request.region,
            group = %request.group,
            count,
            security_group = %security_group_id,
            key_pair = %key_pair.name,
            "Creating nodes"
        );

        let mut tasks = JoinSet::new();
        for index in 0..count {
            let ctx = NodeTask {
                provider: Arc::clone(&self.provider),
                finder: Arc::clone(&self.finder),
                connector: self.connector.clone(),
                config: self.config.clone(),
                request: request.clone(),
                security_group_id: security_group_id.clone(),
                key_pair: key_pair.clone(),
            };
            tasks.spawn(async move { (index, ctx.run(index).await) });
        }

        let mut outcomes: Vec<Option<Result<ProvisionedNode>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "Node provisioning task failed"),
            }
        }

        let outcomes: Vec<Result<ProvisionedNode>> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err(ConvergeError::Cancelled("node provisioning task".to_string()))))
            .collect();
        let ready = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(group = %request.group, ready, failed = count - ready, "Finished creating nodes");
        Ok(outcomes)
    }

    /// Destroy `ids` best-effort, wait for them to go away, then remove the
    /// group's security group and key pair.
    ///
    /// Returns whether the incidental resources were cleaned up.
    pub async fn destroy_nodes_in_group(&self, region: &str, group: &str, ids: &[String]) -> Result<bool> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let provider = Arc::clone(&self.provider);
            let config = self.config.clone();
            let id = id.clone();
            tasks.spawn(async move { destroy_node(provider, &config, &id).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Node destroy task failed");
            }
        }

        self.incidental.clean_up(region, group).await
    }
}

async fn destroy_node<P: NodeProvider>(provider: Arc<P>, config: &ConvergeConfig, id: &str) {
    debug!(node_id = %id, "Destroying node");
    if let Err(e) = provider.destroy_node(id).await {
        warn!(node_id = %id, error = %e, "Failed to destroy node");
        return;
    }

    let snapshot = match provider.refresh_node(id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return,
        Err(e) => {
            warn!(node_id = %id, error = %e, "Failed to refresh destroyed node");
            return;
        }
    };
    let handle = NodeHandle::new(snapshot);
    match StatusConvergence::new(provider, ConvergenceTarget::terminated(), config)
        .apply(&handle)
        .await
    {
        Ok(_) | Err(ConvergeError::ResourceDisappeared { .. }) => {
            info!(node_id = %id, "Node destroyed");
        }
        Err(e) => warn!(node_id = %id, error = %e, "Node did not terminate"),
    }
}

/// Everything one node's provisioning task owns.
struct NodeTask<P, R> {
    provider: Arc<P>,
    finder: Arc<ConcurrentOpenSocketFinder<R>>,
    connector: Option<Arc<dyn ShellConnector>>,
    config: ConvergeConfig,
    request: NodeRequest,
    security_group_id: String,
    key_pair: KeyPair,
}

impl<P: NodeProvider, R: ReachabilityProbe + 'static> NodeTask<P, R> {
    async fn run(self, index: usize) -> Result<ProvisionedNode> {
        let snapshot = self
            .provider
            .create_node(&self.request, &self.security_group_id, &self.key_pair.name)
            .await
            .map_err(|source| ConvergeError::Submission {
                operation: format!("node {} of group {}", index, self.request.group),
                source,
            })?;
        let handle = NodeHandle::new(snapshot);
        debug!(node_id = %handle.id(), index, "Node submitted");

        StatusConvergence::new(Arc::clone(&self.provider), ConvergenceTarget::running(), &self.config)
            .apply(&handle)
            .await?;

        let login = self
            .finder
            .find_open_socket(&handle, self.request.login_port, self.config.port_open_timeout())
            .await?;

        if let Some(connector) = self.connector {
            let credentials = handle.snapshot().credentials.clone();
            let mut session = ShellSession::new(connector, login.clone(), credentials);
            with_retry(&mut session, &BackoffPolicy::from_config(&self.config)).await?;
            if let Err(e) = session.close().await {
                warn!(node_id = %handle.id(), error = %e, "Failed to close login session");
            }
        }

        info!(node_id = %handle.id(), login = %login, "Node ready");
        Ok(ProvisionedNode {
            handle,
            login,
            security_group_id: self.security_group_id,
            key_pair: self.key_pair,
        })
    }
}
