//! Centralized configuration management for the SSH gateway.
//!
//! All configuration is provided via environment variables (optionally from a
//! `.env` file). Only `PRIMARY_DOMAIN` is required; everything else has a
//! default suitable for a single-host deployment.

use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const PRIMARY_DOMAIN: &str = "PRIMARY_DOMAIN";
    pub const EXTRA_DOMAINS: &str = "EXTRA_DOMAINS";
    pub const SSH_LISTEN_ADDR: &str = "SSH_LISTEN_ADDR";
    pub const SSH_ADVERTISED_PORT: &str = "SSH_ADVERTISED_PORT";
    pub const HOST_KEY_PATH: &str = "HOST_KEY_PATH";
    pub const GLOBAL_AUTHORIZED_KEYS_FILE: &str = "GLOBAL_AUTHORIZED_KEYS_FILE";
    pub const INSTANCES_DIR: &str = "INSTANCES_DIR";
    pub const INTERNAL_API_ADDR: &str = "INTERNAL_API_ADDR";
    pub const AUTH_DELAY_MS: &str = "AUTH_DELAY_MS";
    pub const AUTH_JITTER_MS: &str = "AUTH_JITTER_MS";
    pub const DIAL_TIMEOUT_SECS: &str = "DIAL_TIMEOUT_SECS";
    pub const PUBLIC_URL: &str = "PUBLIC_URL";
}

const DEFAULT_SSH_LISTEN_ADDR: &str = "0.0.0.0:2222";
const DEFAULT_HOST_KEY_PATH: &str = "data/ssh/host_key";
const DEFAULT_GLOBAL_AUTHORIZED_KEYS_FILE: &str = "data/authorized_keys";
const DEFAULT_INSTANCES_DIR: &str = "data/instances";
const DEFAULT_INTERNAL_API_ADDR: &str = "127.0.0.1:8888";

/// Minimum time every authentication attempt takes
pub const DEFAULT_AUTH_DELAY: Duration = Duration::from_millis(100);

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Suffix docker uses for instance hostnames on the internal network
pub const INTERNAL_HOST_SUFFIX: &str = ".wisski";

/// DNS label limit
const MAX_SLUG_LENGTH: usize = 63;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Domain instances are subdomains of (e.g. "wisski.example.org")
    pub primary_domain: String,
    /// Alias domains that also map onto instances
    pub extra_domains: Vec<String>,
    pub ssh_listen_addr: String,
    /// Port users are told to connect to (may differ from the listen port behind a mux)
    pub advertised_ssh_port: u16,
    /// Base path of the host keys; each algorithm appends `_<algorithm>`
    pub host_key_path: PathBuf,
    pub global_authorized_keys: PathBuf,
    pub instances_dir: PathBuf,
    pub internal_api_addr: String,
    pub auth_delay: Duration,
    pub auth_jitter: Duration,
    pub dial_timeout: Duration,
    /// Public base URL of the control panel
    pub public_url: String,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let primary_domain = var(env::PRIMARY_DOMAIN)
            .ok_or(ConfigError::Missing(env::PRIMARY_DOMAIN))?
            .trim()
            .to_lowercase();

        let extra_domains: Vec<String> = var(env::EXTRA_DOMAINS)
            .map(|v| {
                v.split(',')
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let ssh_listen_addr =
            var(env::SSH_LISTEN_ADDR).unwrap_or_else(|| DEFAULT_SSH_LISTEN_ADDR.to_string());

        let advertised_ssh_port: u16 = match var(env::SSH_ADVERTISED_PORT) {
            Some(value) => parse_number(env::SSH_ADVERTISED_PORT, &value)?,
            None => {
                let port = ssh_listen_addr.rsplit_once(':').map(|(_, port)| port).unwrap_or("");
                parse_number(env::SSH_LISTEN_ADDR, port).map_err(|_| ConfigError::Invalid {
                    var: env::SSH_LISTEN_ADDR,
                    value: ssh_listen_addr.clone(),
                    reason: "expected <host>:<port>".to_string(),
                })?
            }
        };

        let auth_delay = match var(env::AUTH_DELAY_MS) {
            Some(value) => Duration::from_millis(parse_number(env::AUTH_DELAY_MS, &value)?),
            None => DEFAULT_AUTH_DELAY,
        };
        let auth_jitter = match var(env::AUTH_JITTER_MS) {
            Some(value) => Duration::from_millis(parse_number(env::AUTH_JITTER_MS, &value)?),
            None => Duration::ZERO,
        };
        let dial_timeout = match var(env::DIAL_TIMEOUT_SECS) {
            Some(value) => Duration::from_secs(parse_number(env::DIAL_TIMEOUT_SECS, &value)?),
            None => DEFAULT_DIAL_TIMEOUT,
        };

        let public_url = var(env::PUBLIC_URL)
            .unwrap_or_else(|| format!("http://{}", primary_domain));

        let config = Self {
            extra_domains,
            ssh_listen_addr,
            advertised_ssh_port,
            host_key_path: var(env::HOST_KEY_PATH)
                .unwrap_or_else(|| DEFAULT_HOST_KEY_PATH.to_string())
                .into(),
            global_authorized_keys: var(env::GLOBAL_AUTHORIZED_KEYS_FILE)
                .unwrap_or_else(|| DEFAULT_GLOBAL_AUTHORIZED_KEYS_FILE.to_string())
                .into(),
            instances_dir: var(env::INSTANCES_DIR)
                .unwrap_or_else(|| DEFAULT_INSTANCES_DIR.to_string())
                .into(),
            internal_api_addr: var(env::INTERNAL_API_ADDR)
                .unwrap_or_else(|| DEFAULT_INTERNAL_API_ADDR.to_string()),
            auth_delay,
            auth_jitter,
            dial_timeout,
            public_url,
            primary_domain,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for domain in std::iter::once(&self.primary_domain).chain(&self.extra_domains) {
            if domain.contains(['/', ':', ' ']) || domain.starts_with('.') || domain.ends_with('.') {
                return Err(ConfigError::Invalid {
                    var: env::PRIMARY_DOMAIN,
                    value: domain.clone(),
                    reason: "expected a bare domain name".to_string(),
                });
            }
        }
        if self.auth_delay.is_zero() {
            return Err(ConfigError::Invalid {
                var: env::AUTH_DELAY_MS,
                value: "0".to_string(),
                reason: "authentication delay must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the instance slug a host name refers to.
    ///
    /// The port and an optional `.wisski` suffix (used inside docker) are
    /// ignored and matching is case-insensitive. The bare domain yields the
    /// empty slug; hosts outside of every configured domain yield `None`.
    pub fn slug_from_host(&self, host: &str) -> Option<String> {
        let domain = host.split(':').next().unwrap_or(host).to_lowercase();
        let domain = domain.strip_suffix(INTERNAL_HOST_SUFFIX).unwrap_or(&domain);

        std::iter::once(&self.primary_domain)
            .chain(&self.extra_domains)
            .find_map(|suffix| {
                if domain == suffix {
                    return Some(String::new());
                }
                domain
                    .strip_suffix(suffix.as_str())
                    .and_then(|rest| rest.strip_suffix('.'))
                    .map(str::to_string)
            })
    }

    /// Public hostname of an instance.
    pub fn host_from_slug(&self, slug: &str) -> String {
        if slug.is_empty() {
            return self.primary_domain.clone();
        }
        format!("{}.{}", slug, self.primary_domain)
    }

    /// Page explaining how to use the gateway.
    pub fn help_url(&self) -> String {
        format!("{}/user/ssh", self.public_url.trim_end_matches('/'))
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Check that a slug is a single lowercase DNS label.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LENGTH
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_lookup(|name| match name {
        "PRIMARY_DOMAIN" => Some("wisski.example.org".to_string()),
        "EXTRA_DOMAINS" => Some("wisski.example.net".to_string()),
        _ => None,
    })
    .unwrap()
}
