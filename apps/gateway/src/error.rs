//! Error types for the SSH gateway.

use std::path::PathBuf;

/// Errors raised while handling a single SSH connection.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),
}

/// Errors raised while fetching public keys from the global pool or a tenant pool.
#[derive(Debug, thiserror::Error)]
pub enum KeySourceError {
    #[error("failed to read authorized keys from '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list instances in '{path}': {source}")]
    ListInstances {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("instance registry unavailable: {0}")]
    Registry(String),

    #[error("failed to encode public key: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::from(russh::Error::Disconnect);
        assert!(err.to_string().starts_with("SSH protocol error: "));
    }

    #[test]
    fn test_key_source_error_keeps_path() {
        let err = KeySourceError::Read {
            path: PathBuf::from("/etc/authorized_keys"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/etc/authorized_keys"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
