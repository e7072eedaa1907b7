//! Removal of the per-group resources nodes were created with.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConvergeConfig;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::key_pair::{KeyPairApi, KeyPairCache};
use crate::retry::RetryablePredicate;
use crate::security_group::{SecurityGroupApi, SecurityGroupCache};

const CLEANUP_PERIOD: Duration = Duration::from_millis(50);
const CLEANUP_MAX_PERIOD: Duration = Duration::from_secs(1);

/// Security group and key pair shared by every node of a group.
pub struct IncidentalResources<G: SecurityGroupApi, K: KeyPairApi> {
    security_groups: Arc<SecurityGroupCache<G>>,
    key_pairs: Arc<KeyPairCache<K>>,
    timeout: Duration,
}

impl<G: SecurityGroupApi, K: KeyPairApi> IncidentalResources<G, K> {
    pub fn new(
        security_groups: Arc<SecurityGroupCache<G>>,
        key_pairs: Arc<KeyPairCache<K>>,
        config: &ConvergeConfig,
    ) -> Self {
        Self {
            security_groups,
            key_pairs,
            timeout: config.cleanup_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delete the group's security group, then its key pair.
    ///
    /// The provider refuses to delete a security group while terminating
    /// instances still hold it, so `InUse` is retried until the budget runs
    /// out. Returns `Ok(false)` if the group was still in use at the deadline;
    /// the key pair is left alone in that case.
    pub async fn clean_up(&self, region: &str, group: &str) -> Result<bool> {
        let retry = RetryablePredicate::new(self.timeout, CLEANUP_PERIOD).with_max_period(CLEANUP_MAX_PERIOD);

        let deleted = retry
            .apply::<_, _, ConvergeError>(move || async move {
                match self.security_groups.delete(region, group).await {
                    Ok(_) => Ok(true),
                    Err(ConvergeError::Provider(ProviderError::InUse(reason))) => {
                        debug!(region = %region, group = %group, reason = %reason, "Security group still in use");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        if !deleted {
            warn!(
                region = %region,
                group = %group,
                timeout_ms = self.timeout.as_millis() as u64,
                "Security group still in use, skipping cleanup"
            );
            return Ok(false);
        }

        self.key_pairs.delete(region, group).await?;
        info!(region = %region, group = %group, "Cleaned up incidental resources");
        Ok(true)
    }
}
