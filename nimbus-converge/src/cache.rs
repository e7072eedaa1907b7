//! Create-if-needed memoization for regional resources.
//!
//! Security groups and key pairs follow the same pattern on every provider:
//! the first request for a (region, name) creates the resource, every later
//! or concurrent request reuses it, and a "duplicate" answer from the provider
//! means another process won the race and the existing resource is looked up.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{ConvergeError, ProviderError, Result};

/// Identifies a memoized resource.
///
/// Equality covers region, name and discriminator; nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionalResourceKey {
    pub region: String,
    pub name: String,
    /// Extra identity, e.g. the ingress rule set of a security group.
    pub discriminator: Option<String>,
}

impl RegionalResourceKey {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
            discriminator: None,
        }
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }
}

impl fmt::Display for RegionalResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.name)?;
        if let Some(d) = &self.discriminator {
            write!(f, "#{}", d)?;
        }
        Ok(())
    }
}

/// Result of asking a provider to create a named resource.
#[derive(Debug)]
pub enum CreateOutcome<V> {
    Created(V),
    /// The name is taken. Carries the existing resource when the provider returned it.
    AlreadyExists(Option<V>),
    Failed(ProviderError),
}

impl<V> From<std::result::Result<V, ProviderError>> for CreateOutcome<V> {
    fn from(result: std::result::Result<V, ProviderError>) -> Self {
        match result {
            Ok(v) => CreateOutcome::Created(v),
            Err(ProviderError::AlreadyExists(_)) => CreateOutcome::AlreadyExists(None),
            Err(e) => CreateOutcome::Failed(e),
        }
    }
}

/// Provider side of a create-or-reuse cache.
#[async_trait]
pub trait ResourceCreator: Send + Sync {
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync;
    type Resource: Clone + Send + Sync;

    async fn create(&self, key: &Self::Key) -> CreateOutcome<Self::Resource>;

    /// Look up an existing resource by the same key.
    async fn describe(&self, key: &Self::Key) -> std::result::Result<Option<Self::Resource>, ProviderError>;
}

/// Per-key memoization map.
///
/// Each key owns one cell; concurrent callers for a key wait on the same
/// initialization and only one factory runs at a time. A failed factory
/// leaves the cell empty so the next caller tries again.
pub struct Memoizer<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K: Clone + Eq + Hash, V: Clone> Memoizer<K, V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create<F, Fut, E>(&self, key: &K, factory: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(key.clone()).or_default())
        };
        cell.get_or_try_init(factory).await.cloned()
    }

    /// Forget a key. A creation already in flight still completes for its
    /// waiters, but its result is not served to later callers.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.remove(key).is_some()
    }

    pub fn cached(&self, key: &K) -> Option<V> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|cell| cell.get().cloned())
    }
}

impl<K: Clone + Eq + Hash, V: Clone> Default for Memoizer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Memoizing cache that creates a resource on first use and reuses it afterwards.
///
/// Within one cache, concurrent `get`s for a key issue at most one create
/// call. Callers must [`invalidate`](Self::invalidate) a key after deleting
/// the remote resource, or later `get`s will serve the deleted handle.
pub struct CreateOrReuseCache<C: ResourceCreator> {
    creator: Arc<C>,
    memo: Memoizer<C::Key, C::Resource>,
}

impl<C: ResourceCreator> CreateOrReuseCache<C> {
    pub fn new(creator: Arc<C>) -> Self {
        Self {
            creator,
            memo: Memoizer::new(),
        }
    }

    pub fn creator(&self) -> &C {
        &self.creator
    }

    pub async fn get(&self, key: &C::Key) -> Result<C::Resource> {
        let creator = self.creator.as_ref();
        self.memo
            .get_or_create(key, || create_or_reuse(creator, key))
            .await
    }

    pub fn invalidate(&self, key: &C::Key) -> bool {
        let removed = self.memo.invalidate(key);
        if removed {
            debug!(key = %key, "Invalidated cached resource");
        }
        removed
    }

    pub fn cached(&self, key: &C::Key) -> Option<C::Resource> {
        self.memo.cached(key)
    }
}

async fn create_or_reuse<C: ResourceCreator>(creator: &C, key: &C::Key) -> Result<C::Resource> {
    debug!(key = %key, "Creating resource");
    match creator.create(key).await {
        CreateOutcome::Created(resource) => {
            info!(key = %key, "Created resource");
            Ok(resource)
        }
        CreateOutcome::AlreadyExists(Some(resource)) => {
            info!(key = %key, "Resource already exists, reusing");
            Ok(resource)
        }
        CreateOutcome::AlreadyExists(None) => {
            info!(key = %key, "Resource already exists, looking it up");
            match creator.describe(key).await? {
                Some(resource) => Ok(resource),
                None => Err(ConvergeError::ResourceDisappeared {
                    id: key.to_string(),
                    target: "reuse after duplicate create".to_string(),
                }),
            }
        }
        CreateOutcome::Failed(e) => Err(e.into()),
    }
}
