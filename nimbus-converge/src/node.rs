//! Node handles and status snapshots.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a remote compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Suspended,
    Terminated,
    Error,
    Unrecognized,
}

impl NodeStatus {
    /// TERMINATED and ERROR never transition back to RUNNING.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Terminated | NodeStatus::Error)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Suspended => "SUSPENDED",
            NodeStatus::Terminated => "TERMINATED",
            NodeStatus::Error => "ERROR",
            NodeStatus::Unrecognized => "UNRECOGNIZED",
        };
        f.write_str(s)
    }
}

/// Login credentials handed back by the provider for a new node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Point-in-time view of a node as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub status: NodeStatus,
    pub public_addresses: Vec<IpAddr>,
    pub private_addresses: Vec<IpAddr>,
    pub credentials: Option<LoginCredentials>,
}

impl NodeSnapshot {
    pub fn new(id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            id: id.into(),
            status,
            public_addresses: Vec::new(),
            private_addresses: Vec::new(),
            credentials: None,
        }
    }

    pub fn with_public_address(mut self, addr: IpAddr) -> Self {
        self.public_addresses.push(addr);
        self
    }

    pub fn with_private_address(mut self, addr: IpAddr) -> Self {
        self.private_addresses.push(addr);
        self
    }

    pub fn with_credentials(mut self, credentials: LoginCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Public addresses first, then private ones, without duplicates.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut out = Vec::with_capacity(self.public_addresses.len() + self.private_addresses.len());
        for addr in self.public_addresses.iter().chain(&self.private_addresses) {
            if !out.contains(addr) {
                out.push(*addr);
            }
        }
        out
    }
}

/// Shared, mutable handle to a node.
///
/// The handle holds one cell that the polling loop replaces wholesale on each
/// refresh. Readers must take one [`snapshot`](Self::snapshot) and read every
/// field from it; reading status and addresses through separate calls may
/// straddle a refresh.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: String,
    current: Arc<RwLock<Arc<NodeSnapshot>>>,
}

impl NodeHandle {
    pub fn new(snapshot: NodeSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest snapshot. Cheap; clones an `Arc`.
    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn status(&self) -> NodeStatus {
        self.snapshot().status
    }

    /// Replace the snapshot in place so every clone of this handle observes it.
    pub fn update(&self, snapshot: NodeSnapshot) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
    }
}
