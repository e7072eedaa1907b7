//! Single-shot TCP reachability probes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::ConvergeError;

/// A host (name or IP literal) and a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = ConvergeError;

    /// Accepts `host:port` and `[v6-literal]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConvergeError::Configuration(format!("invalid host:port '{}'", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() || (!s.starts_with('[') && host.contains(':')) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// Checks whether a socket accepts connections. Never retries internally.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `true` only if the connection was established.
    async fn probe(&self, target: &HostAndPort) -> bool;
}

/// Probes by opening a TCP connection with a connect timeout and closing it at once.
#[derive(Debug, Clone)]
pub struct SocketOpenTester {
    connect_timeout: Duration,
}

impl SocketOpenTester {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl ReachabilityProbe for SocketOpenTester {
    async fn probe(&self, target: &HostAndPort) -> bool {
        trace!(target = %target, "Testing socket");
        // Name resolution happens inside connect, so DNS failures land here too.
        match timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                debug!(target = %target, "Socket open");
                true
            }
            Ok(Err(e)) => {
                trace!(target = %target, error = %e, "Socket not reachable");
                false
            }
            Err(_) => {
                trace!(
                    target = %target,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Socket connect timed out"
                );
                false
            }
        }
    }
}
