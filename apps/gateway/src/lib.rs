//! WissKI SSH gateway library.
//!
//! A single SSH listener that authenticates callers against the global and
//! per-instance key pools and forwards `direct-tcpip` channels to the SSH
//! port of the instances they may reach.

pub mod config;
pub mod error;
pub mod instances;
pub mod key;
pub mod keysource;
pub mod management;
pub mod ssh;
pub mod state;

pub use config::{is_valid_slug, Config, ConfigError};
pub use error::{GatewayError, KeySourceError};
pub use instances::{DirectoryInstances, Instances, Tenant};
pub use key::{read_or_make_host_key, read_or_make_host_keys, HostKeyAlgorithm, HostKeyError};
pub use keysource::{AuthorizedKeysFile, GlobalKeys, KeySource};
pub use management::run_internal_api;
pub use ssh::{
    AuthorizationEngine, BackendResolver, DockerBackend, ForwardingGateway, GatewayServer,
    PermissionMap, SshHandler,
};
pub use state::GatewayState;
