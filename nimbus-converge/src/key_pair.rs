//! Per-group login key pairs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CreateOrReuseCache, CreateOutcome, RegionalResourceKey, ResourceCreator};
use crate::error::{ProviderError, Result};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub name: String,
    pub fingerprint: String,
    /// Only present on the response that created the key pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait KeyPairApi: Send + Sync {
    /// A taken name must be reported as [`ProviderError::AlreadyExists`].
    async fn create_key_pair(&self, region: &str, name: &str) -> std::result::Result<KeyPair, ProviderError>;

    async fn describe_key_pair(
        &self,
        region: &str,
        name: &str,
    ) -> std::result::Result<Option<KeyPair>, ProviderError>;

    async fn delete_key_pair(&self, region: &str, name: &str) -> std::result::Result<(), ProviderError>;
}

pub fn key_pair_name(group: &str) -> String {
    format!("nimbus-{}", group)
}

pub struct KeyPairCreator<A> {
    api: Arc<A>,
}

#[async_trait]
impl<A: KeyPairApi> ResourceCreator for KeyPairCreator<A> {
    type Key = RegionalResourceKey;
    type Resource = KeyPair;

    async fn create(&self, key: &RegionalResourceKey) -> CreateOutcome<KeyPair> {
        debug!(region = %key.region, name = %key.name, "Creating key pair");
        self.api.create_key_pair(&key.region, &key.name).await.into()
    }

    async fn describe(&self, key: &RegionalResourceKey) -> std::result::Result<Option<KeyPair>, ProviderError> {
        self.api.describe_key_pair(&key.region, &key.name).await
    }
}

/// Key pairs memoized by (region, group).
///
/// A key pair reused after a duplicate create comes back without private key
/// material; callers that need to log in must bring their own credentials.
pub struct KeyPairCache<A: KeyPairApi> {
    api: Arc<A>,
    cache: CreateOrReuseCache<KeyPairCreator<A>>,
}

impl<A: KeyPairApi> KeyPairCache<A> {
    pub fn new(api: Arc<A>) -> Self {
        let creator = KeyPairCreator {
            api: Arc::clone(&api),
        };
        Self {
            api,
            cache: CreateOrReuseCache::new(Arc::new(creator)),
        }
    }

    pub fn key(region: &str, group: &str) -> RegionalResourceKey {
        RegionalResourceKey::new(region, key_pair_name(group))
    }

    pub async fn get(&self, region: &str, group: &str) -> Result<KeyPair> {
        self.cache.get(&Self::key(region, group)).await
    }

    pub fn cached(&self, region: &str, group: &str) -> Option<KeyPair> {
        self.cache.cached(&Self::key(region, group))
    }

    pub fn invalidate(&self, region: &str, group: &str) -> bool {
        self.cache.invalidate(&Self::key(region, group))
    }

    /// Delete the group's key pair. Returns false if it was already gone.
    /// The cached entry is dropped either way.
    pub async fn delete(&self, region: &str, group: &str) -> Result<bool> {
        let name = key_pair_name(group);
        debug!(region = %region, name = %name, "Deleting key pair");
        let deleted = match self.api.delete_key_pair(region, &name).await {
            Ok(()) => true,
            Err(ProviderError::NotFound(_)) => false,
            Err(e) => {
                self.invalidate(region, group);
                return Err(e.into());
            }
        };
        self.invalidate(region, group);
        if deleted {
            info!(region = %region, name = %name, "Deleted key pair");
        }
        Ok(deleted)
    }
}
