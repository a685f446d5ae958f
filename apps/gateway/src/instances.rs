//! Tenant instance registry.
//!
//! The gateway only needs two things from the registry: the list of known
//! instances and, for each, the public keys allowed to reach it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use russh::keys::PublicKey;

use crate::config::is_valid_slug;
use crate::error::KeySourceError;
use crate::keysource::read_authorized_keys;

/// A single hosted instance.
#[async_trait]
pub trait Tenant: Send + Sync {
    fn slug(&self) -> &str;

    /// Keys allowed to reach this instance.
    async fn keys(&self) -> Result<Vec<PublicKey>, KeySourceError>;
}

/// Registry of every instance currently known.
#[async_trait]
pub trait Instances: Send + Sync {
    async fn all(&self) -> Result<Vec<Arc<dyn Tenant>>, KeySourceError>;

    async fn get(&self, slug: &str) -> Result<Option<Arc<dyn Tenant>>, KeySourceError> {
        Ok(self.all().await?.into_iter().find(|t| t.slug() == slug))
    }
}

/// Registry laid out on disk as one directory per instance:
///
/// ```text
/// <root>/<slug>/authorized_keys
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryInstances {
    root: PathBuf,
}

impl DirectoryInstances {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tenant(&self, slug: &str) -> Arc<dyn Tenant> {
        Arc::new(DirectoryTenant {
            slug: slug.to_string(),
            keys_file: self.root.join(slug).join("authorized_keys"),
        })
    }
}

#[async_trait]
impl Instances for DirectoryInstances {
    async fn all(&self) -> Result<Vec<Arc<dyn Tenant>>, KeySourceError> {
        let list_err = |source| KeySourceError::ListInstances {
            path: self.root.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(list_err)?;
        let mut slugs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            if !entry.file_type().await.map_err(list_err)?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if is_valid_slug(&name) => slugs.push(name),
                Ok(name) => debug!("Ignoring instance directory with invalid slug: {}", name),
                Err(name) => warn!("Ignoring non UTF-8 instance directory: {:?}", name),
            }
        }
        slugs.sort();

        Ok(slugs.iter().map(|slug| self.tenant(slug)).collect())
    }

    async fn get(&self, slug: &str) -> Result<Option<Arc<dyn Tenant>>, KeySourceError> {
        if !is_valid_slug(slug) {
            return Ok(None);
        }
        match tokio::fs::metadata(self.root.join(slug)).await {
            Ok(meta) if meta.is_dir() => Ok(Some(self.tenant(slug))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(KeySourceError::ListInstances {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

struct DirectoryTenant {
    slug: String,
    keys_file: PathBuf,
}

#[async_trait]
impl Tenant for DirectoryTenant {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn keys(&self) -> Result<Vec<PublicKey>, KeySourceError> {
        match read_authorized_keys(&self.keys_file).await {
            Err(KeySourceError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Vec::new())
            }
            other => other,
        }
    }
}
