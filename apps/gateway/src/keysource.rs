//! Public key pools consulted during authentication.
//!
//! There are two kinds of pools: the global pool, read from a single
//! `authorized_keys` file and granting access to every instance, and one pool
//! per tenant instance, fetched through the [`Instances`] registry. Nothing is
//! cached; every call reads the current state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use russh::keys::PublicKey;
use russh_keys::ssh_key::authorized_keys::Entry;

use crate::error::KeySourceError;
use crate::instances::{Instances, Tenant};

/// Source of the global (administrator) key pool.
#[async_trait]
pub trait GlobalKeys: Send + Sync {
    async fn admin_keys(&self) -> Result<Vec<PublicKey>, KeySourceError>;
}

/// Global pool backed by an OpenSSH `authorized_keys` file.
#[derive(Debug, Clone)]
pub struct AuthorizedKeysFile {
    path: PathBuf,
}

impl AuthorizedKeysFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl GlobalKeys for AuthorizedKeysFile {
    async fn admin_keys(&self) -> Result<Vec<PublicKey>, KeySourceError> {
        read_authorized_keys(&self.path).await
    }
}

/// Read and parse an `authorized_keys` file.
pub async fn read_authorized_keys(path: &Path) -> Result<Vec<PublicKey>, KeySourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| KeySourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_authorized_keys(&contents))
}

/// Parse every valid key in `authorized_keys` format, skipping blank lines,
/// comments and anything that fails to parse.
pub fn parse_authorized_keys(contents: &str) -> Vec<PublicKey> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<Entry>() {
            Ok(entry) => Some(entry.public_key().clone()),
            Err(e) => {
                debug!("Skipping unparsable authorized_keys line: {}", e);
                None
            }
        })
        .collect()
}

/// Exact public key equality. Comments are not part of the key.
pub fn keys_equal(a: &PublicKey, b: &PublicKey) -> bool {
    a.key_data() == b.key_data()
}

/// Check if `key` is one of `keys`.
pub fn key_one_of(keys: &[PublicKey], key: &PublicKey) -> bool {
    keys.iter().any(|candidate| keys_equal(candidate, key))
}

/// Encode a key as a single `authorized_keys` line, including the trailing newline.
pub fn authorized_key_line(key: &PublicKey) -> Result<String, KeySourceError> {
    let mut bare = key.clone();
    bare.set_comment("");
    let mut line = bare
        .to_openssh()
        .map_err(|e| KeySourceError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Both key pools, as seen by the authorization engine and the internal API.
#[derive(Clone)]
pub struct KeySource {
    global: Arc<dyn GlobalKeys>,
    instances: Arc<dyn Instances>,
}

impl KeySource {
    pub fn new(global: Arc<dyn GlobalKeys>, instances: Arc<dyn Instances>) -> Self {
        Self { global, instances }
    }

    /// Keys granting access to every instance.
    pub async fn admin_keys(&self) -> Result<Vec<PublicKey>, KeySourceError> {
        self.global.admin_keys().await
    }

    /// Every tenant currently known to the registry.
    pub async fn tenants(&self) -> Result<Vec<Arc<dyn Tenant>>, KeySourceError> {
        self.instances.all().await
    }

    /// A single tenant, or `None` if the registry does not know it.
    pub async fn tenant(&self, slug: &str) -> Result<Option<Arc<dyn Tenant>>, KeySourceError> {
        self.instances.get(slug).await
    }
}
