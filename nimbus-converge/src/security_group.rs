//! Per-group security groups, created once per region and ingress rule set.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CreateOrReuseCache, CreateOutcome, RegionalResourceKey, ResourceCreator};
use crate::error::{ConvergeError, ProviderError, Result};

/// Provider primitives for security groups. Groups are addressed by name.
#[async_trait]
pub trait SecurityGroupApi: Send + Sync {
    /// Create a group allowing inbound TCP on `inbound_ports` and return its id.
    /// A taken name must be reported as [`ProviderError::AlreadyExists`].
    async fn create_security_group(
        &self,
        region: &str,
        name: &str,
        inbound_ports: &BTreeSet<u16>,
    ) -> std::result::Result<String, ProviderError>;

    async fn describe_security_group(
        &self,
        region: &str,
        name: &str,
    ) -> std::result::Result<Option<SecurityGroup>, ProviderError>;

    /// Open additional inbound TCP ports on an existing group.
    async fn authorize_ingress(
        &self,
        region: &str,
        name: &str,
        ports: &BTreeSet<u16>,
    ) -> std::result::Result<(), ProviderError>;

    /// Fails with [`ProviderError::InUse`] while instances still reference the group.
    async fn delete_security_group(&self, region: &str, name: &str) -> std::result::Result<(), ProviderError>;
}

/// A security group and the inbound TCP ports it allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub inbound_ports: BTreeSet<u16>,
}

/// Name of the shared security group for a node group.
pub fn security_group_name(group: &str) -> String {
    format!("nimbus-{}", group)
}

fn encode_ports(ports: &BTreeSet<u16>) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_ports(key: &RegionalResourceKey) -> Result<BTreeSet<u16>> {
    let Some(encoded) = key.discriminator.as_deref() else {
        return Ok(BTreeSet::new());
    };
    encoded
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>().map_err(|_| {
                ConvergeError::Configuration(format!("invalid port '{}' in key {}", s, key))
            })
        })
        .collect()
}

/// Adapts a [`SecurityGroupApi`] to the create-or-reuse cache.
///
/// The remote name only carries the group, so a group found through a
/// duplicate may predate the requested rule set; missing ports are
/// authorized before it is handed out.
pub struct SecurityGroupCreator<A> {
    api: Arc<A>,
}

impl<A: SecurityGroupApi> SecurityGroupCreator<A> {
    async fn reuse(
        &self,
        key: &RegionalResourceKey,
        ports: &BTreeSet<u16>,
    ) -> std::result::Result<Option<SecurityGroup>, ProviderError> {
        let Some(mut group) = self.api.describe_security_group(&key.region, &key.name).await? else {
            return Ok(None);
        };
        let missing: BTreeSet<u16> = ports.difference(&group.inbound_ports).copied().collect();
        if !missing.is_empty() {
            debug!(region = %key.region, name = %key.name, ports = ?missing, "Authorizing missing ingress ports");
            self.api
                .authorize_ingress(&key.region, &key.name, &missing)
                .await?;
            group.inbound_ports.extend(missing);
        }
        Ok(Some(group))
    }
}

#[async_trait]
impl<A: SecurityGroupApi> ResourceCreator for SecurityGroupCreator<A> {
    type Key = RegionalResourceKey;
    type Resource = SecurityGroup;

    async fn create(&self, key: &RegionalResourceKey) -> CreateOutcome<SecurityGroup> {
        let ports = match decode_ports(key) {
            Ok(ports) => ports,
            Err(e) => return CreateOutcome::Failed(ProviderError::Other(e.into())),
        };
        debug!(region = %key.region, name = %key.name, ports = ?ports, "Creating security group");
        match self
            .api
            .create_security_group(&key.region, &key.name, &ports)
            .await
        {
            Ok(id) => CreateOutcome::Created(SecurityGroup {
                id,
                name: key.name.clone(),
                inbound_ports: ports,
            }),
            Err(ProviderError::AlreadyExists(_)) => match self.reuse(key, &ports).await {
                Ok(group) => CreateOutcome::AlreadyExists(group),
                Err(e) => CreateOutcome::Failed(e),
            },
            Err(e) => CreateOutcome::Failed(e),
        }
    }

    async fn describe(
        &self,
        key: &RegionalResourceKey,
    ) -> std::result::Result<Option<SecurityGroup>, ProviderError> {
        self.api.describe_security_group(&key.region, &key.name).await
    }
}

/// Security groups memoized by (region, group name, inbound ports).
pub struct SecurityGroupCache<A: SecurityGroupApi> {
    api: Arc<A>,
    cache: CreateOrReuseCache<SecurityGroupCreator<A>>,
    /// Every key handed out, so a delete can invalidate all rule-set variants.
    issued: Mutex<HashSet<RegionalResourceKey>>,
}

impl<A: SecurityGroupApi> SecurityGroupCache<A> {
    pub fn new(api: Arc<A>) -> Self {
        let creator = SecurityGroupCreator {
            api: Arc::clone(&api),
        };
        Self {
            api,
            cache: CreateOrReuseCache::new(Arc::new(creator)),
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn key(region: &str, group: &str, inbound_ports: &BTreeSet<u16>) -> RegionalResourceKey {
        RegionalResourceKey::new(region, security_group_name(group))
            .with_discriminator(encode_ports(inbound_ports))
    }

    /// The group's security group, created on first use. The result allows
    /// at least `inbound_ports`.
    pub async fn get(
        &self,
        region: &str,
        group: &str,
        inbound_ports: &BTreeSet<u16>,
    ) -> Result<SecurityGroup> {
        let key = Self::key(region, group, inbound_ports);
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        self.cache.get(&key).await
    }

    pub fn invalidate(&self, key: &RegionalResourceKey) -> bool {
        self.cache.invalidate(key)
    }

    /// Delete the group's security group if it exists and drop every cached
    /// entry for it. Returns whether a remote group was deleted.
    pub async fn delete(&self, region: &str, group: &str) -> Result<bool> {
        let name = security_group_name(group);
        let existed = self.api.describe_security_group(region, &name).await?.is_some();
        if existed {
            debug!(region = %region, name = %name, "Deleting security group");
            self.api.delete_security_group(region, &name).await?;
            info!(region = %region, name = %name, "Deleted security group");
        }
        self.invalidate_group(region, &name);
        Ok(existed)
    }

    fn invalidate_group(&self, region: &str, name: &str) {
        let keys: Vec<RegionalResourceKey> = {
            let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
            let matching: Vec<_> = issued
                .iter()
                .filter(|k| k.region == region && k.name == name)
                .cloned()
                .collect();
            for key in &matching {
                issued.remove(key);
            }
            matching
        };
        for key in keys {
            self.cache.invalidate(&key);
        }
    }
}
