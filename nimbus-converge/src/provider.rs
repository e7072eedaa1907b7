//! Primitives that provider adapters implement for the convergence core.
//!
//! Adapters translate these calls into their own REST/XML/JSON APIs and map
//! provider error codes onto [`ProviderError`] kinds.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::node::NodeSnapshot;

/// Reports the current state of a node.
#[async_trait]
pub trait NodeStatusSource: Send + Sync {
    /// Fresh snapshot, or `None` if the provider no longer knows the node.
    ///
    /// Implementations that want transient failures retried should return a
    /// snapshot with the previous status instead of an error; errors abort
    /// the wait that issued the call.
    async fn refresh_node(&self, id: &str) -> Result<Option<NodeSnapshot>, ProviderError>;
}

/// What to create when provisioning a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub region: String,
    pub group: String,
    pub image_id: String,
    pub hardware_id: String,
    /// TCP ports opened in the group's security group.
    pub inbound_ports: BTreeSet<u16>,
    /// Port probed once the node is running.
    pub login_port: u16,
}

impl NodeRequest {
    pub fn new(
        region: impl Into<String>,
        group: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            group: group.into(),
            image_id: image_id.into(),
            hardware_id: String::new(),
            inbound_ports: BTreeSet::from([22]),
            login_port: 22,
        }
    }
}

/// Creates and destroys nodes.
#[async_trait]
pub trait NodeProvider: NodeStatusSource {
    /// Start creating a node. The returned snapshot is usually still PENDING.
    async fn create_node(
        &self,
        request: &NodeRequest,
        security_group_id: &str,
        key_name: &str,
    ) -> Result<NodeSnapshot, ProviderError>;

    async fn destroy_node(&self, id: &str) -> Result<(), ProviderError>;
}
