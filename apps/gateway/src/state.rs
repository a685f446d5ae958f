//! Shared state of the gateway, built once at startup.

use std::sync::Arc;

use crate::config::Config;
use crate::instances::DirectoryInstances;
use crate::keysource::{AuthorizedKeysFile, KeySource};
use crate::ssh::{AuthorizationEngine, BackendResolver, DockerBackend, ForwardingGateway};

/// Everything a connection or an API request needs, shared read-only.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub keys: KeySource,
    pub engine: AuthorizationEngine,
    pub gateway: ForwardingGateway,
}

impl GatewayState {
    pub fn new(config: Config, keys: KeySource, backends: Arc<dyn BackendResolver>) -> Self {
        let config = Arc::new(config);
        let engine =
            AuthorizationEngine::new(keys.clone(), config.auth_delay).with_jitter(config.auth_jitter);
        let gateway = ForwardingGateway::new(config.clone(), backends);
        Self {
            config,
            keys,
            engine,
            gateway,
        }
    }

    /// State backed by the on-disk key files and the docker network.
    pub fn from_config(config: Config) -> Self {
        let keys = KeySource::new(
            Arc::new(AuthorizedKeysFile::new(&config.global_authorized_keys)),
            Arc::new(DirectoryInstances::new(&config.instances_dir)),
        );
        let backends = Arc::new(DockerBackend::new(&config));
        Self::new(config, keys, backends)
    }
}
