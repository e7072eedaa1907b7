//! Retried acquisition of connections to running nodes.
//!
//! Shell transports (SSH and friends) live outside this crate. They plug in
//! through [`ShellConnector`]; [`with_retry`] owns the reconnect loop so each
//! transport does not carry its own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ConvergeConfig;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::node::LoginCredentials;
use crate::socket::HostAndPort;

/// A resource that can be torn down and re-created between attempts.
#[async_trait]
pub trait Connection: fmt::Display + Send {
    type Output: Send;

    /// Release whatever the previous attempt left behind.
    async fn clear(&mut self) -> std::result::Result<(), ProviderError>;

    async fn create(&mut self) -> std::result::Result<Self::Output, ProviderError>;
}

/// How many times to try and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &ConvergeConfig) -> Self {
        Self::new(config.ssh_max_retries, config.retry_base_delay())
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Lookup failures will not change on retry; everything else might.
    pub fn should_retry(&self, error: &ProviderError) -> bool {
        !matches!(
            error,
            ProviderError::NotFound(_) | ProviderError::AlreadyExists(_)
        )
    }
}

/// Acquire `connection`, calling `clear` then `create` on every attempt.
pub async fn with_retry<C: Connection>(connection: &mut C, policy: &BackoffPolicy) -> Result<C::Output> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(connection = %connection, attempt, "Acquiring connection");
        let result = match connection.clear().await {
            Ok(()) => connection.create().await,
            Err(e) => Err(e),
        };

        let error = match result {
            Ok(output) => {
                debug!(connection = %connection, attempt, "Acquired connection");
                return Ok(output);
            }
            Err(e) => e,
        };

        if !policy.should_retry(&error) {
            warn!(connection = %connection, error = %error, "Error acquiring connection (not retryable)");
            return Err(ConvergeError::Provider(error));
        }
        if attempt >= max_attempts {
            warn!(connection = %connection, attempts = attempt, error = %error, "Out of retries");
            return Err(ConvergeError::RetriesExhausted {
                connection: connection.to_string(),
                attempts: max_attempts,
                source: error,
            });
        }

        info!(
            connection = %connection,
            attempt,
            max_attempts,
            error = %error,
            "Error acquiring connection, retrying"
        );
        sleep(policy.delay_for(attempt)).await;
        attempt += 1;
    }
}

/// Opens and closes shell sessions on nodes.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(
        &self,
        target: &HostAndPort,
        credentials: Option<&LoginCredentials>,
    ) -> std::result::Result<(), ProviderError>;

    async fn disconnect(&self, target: &HostAndPort) -> std::result::Result<(), ProviderError>;
}

/// A login session to one node, acquired through [`with_retry`].
pub struct ShellSession {
    connector: Arc<dyn ShellConnector>,
    target: HostAndPort,
    credentials: Option<LoginCredentials>,
    connected: bool,
}

impl ShellSession {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        target: HostAndPort,
        credentials: Option<LoginCredentials>,
    ) -> Self {
        Self {
            connector,
            target,
            credentials,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn close(&mut self) -> std::result::Result<(), ProviderError> {
        self.clear().await
    }
}

impl fmt::Display for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let user = self.credentials.as_ref().map(|c| c.user.as_str()).unwrap_or("?");
        write!(f, "session({}@{})", user, self.target)
    }
}

#[async_trait]
impl Connection for ShellSession {
    type Output = HostAndPort;

    async fn clear(&mut self) -> std::result::Result<(), ProviderError> {
        if self.connected {
            self.connected = false;
            if let Err(e) = self.connector.disconnect(&self.target).await {
                warn!(target = %self.target, error = %e, "Error closing session");
            }
        }
        Ok(())
    }

    async fn create(&mut self) -> std::result::Result<HostAndPort, ProviderError> {
        self.connector
            .connect(&self.target, self.credentials.as_ref())
            .await?;
        self.connected = true;
        Ok(self.target.clone())
    }
}
