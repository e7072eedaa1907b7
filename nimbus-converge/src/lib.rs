//! nimbus-converge - convergence and caching core for cloud compute adapters.
//!
//! Provider adapters supply the remote primitives (refresh a node, create a
//! security group, begin an image bake). This crate turns them into bounded,
//! cancellable waits and at-most-once resource creation:
//! - [`RetryablePredicate`]: the polling engine every wait is built on
//! - [`StatusConvergence`]: wait for a node to reach a target status
//! - [`ConcurrentOpenSocketFinder`]: race reachability probes across a node's addresses
//! - [`ImageReadyPoller`]: background image-bake polling exposed as a future
//! - [`CreateOrReuseCache`]: create-if-needed memoization for regional resources
//!
//! # Example
//! ```ignore
//! use nimbus_converge::{ConvergeConfig, ConvergenceTarget, StatusConvergence};
//!
//! let config = ConvergeConfig::default();
//! let poller = StatusConvergence::new(provider, ConvergenceTarget::running(), &config);
//! let node = poller.apply(&handle).await?;
//! ```

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod connection;
pub mod convergence;
pub mod error;
pub mod image;
pub mod key_pair;
pub mod node;
pub mod provider;
pub mod provision;
pub mod retry;
pub mod security_group;
pub mod socket;
pub mod socket_finder;

pub use cache::{CreateOrReuseCache, CreateOutcome, RegionalResourceKey, ResourceCreator};
pub use cleanup::IncidentalResources;
pub use config::ConvergeConfig;
pub use connection::{with_retry, BackoffPolicy, Connection, ShellConnector, ShellSession};
pub use convergence::{ConvergenceTarget, StatusConvergence};
pub use error::{ConvergeError, ProviderError, Result};
pub use image::{Image, ImageCreation, ImageReadyPoller, ImageService, ImageStatus, ImageTemplate};
pub use key_pair::{KeyPair, KeyPairApi, KeyPairCache};
pub use node::{LoginCredentials, NodeHandle, NodeSnapshot, NodeStatus};
pub use provider::{NodeProvider, NodeRequest, NodeStatusSource};
pub use provision::{ProvisionedNode, Provisioner};
pub use retry::RetryablePredicate;
pub use security_group::{SecurityGroup, SecurityGroupApi, SecurityGroupCache};
pub use socket::{HostAndPort, ReachabilityProbe, SocketOpenTester};
pub use socket_finder::ConcurrentOpenSocketFinder;
