//! Per-connection authorization state and forward request types.

use std::collections::BTreeMap;

use russh::ChannelOpenFailure;

/// Slug under which global (administrator) access is recorded.
pub const GLOBAL_SLUG: &str = "";

/// Result of one authentication attempt: which instances the key may reach.
///
/// The entry for [`GLOBAL_SLUG`] records administrator access, which implies
/// access to every instance. The map is built once by the authorization
/// engine and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMap {
    entries: BTreeMap<String, bool>,
}

impl PermissionMap {
    /// Start a map with the given global access.
    pub fn new(global: bool) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(GLOBAL_SLUG.to_string(), global);
        Self { entries }
    }

    /// Record access to a single instance. Global access always wins.
    pub(crate) fn record(&mut self, slug: &str, access: bool) {
        let granted = access || self.is_global();
        self.entries.insert(slug.to_string(), granted);
    }

    pub fn is_global(&self) -> bool {
        self.entries.get(GLOBAL_SLUG).copied().unwrap_or(false)
    }

    /// The computed entry for `slug`, if any.
    pub fn get(&self, slug: &str) -> Option<bool> {
        self.entries.get(slug).copied()
    }

    /// Check if the connection may reach `slug`.
    pub fn grants(&self, slug: &str) -> bool {
        self.is_global() || self.get(slug).unwrap_or(false)
    }

    /// Whether the key matched any pool at all.
    pub fn any_access(&self) -> bool {
        self.entries.values().any(|granted| *granted)
    }

    /// Some instance the connection may reach, for display purposes.
    ///
    /// Returns the first granted slug in lexicographic order. With only
    /// global access and no instances this is the empty slug; without any
    /// access it is `None`.
    pub fn example_slug(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(slug, granted)| **granted && !slug.is_empty())
            .map(|(slug, _)| slug.as_str())
            .or_else(|| self.is_global().then_some(GLOBAL_SLUG))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A `direct-tcpip` channel open request (RFC 4254, section 7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub dest_addr: String,
    pub dest_port: u32,
    pub origin_addr: String,
    pub origin_port: u32,
}

impl ForwardRequest {
    pub fn new(dest_addr: &str, dest_port: u32, origin_addr: &str, origin_port: u32) -> Self {
        Self {
            dest_addr: dest_addr.to_string(),
            dest_port,
            origin_addr: origin_addr.to_string(),
            origin_port,
        }
    }
}

/// Why a `direct-tcpip` channel was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardRejection {
    /// The request was allowed but the backend could not be reached,
    /// or the request itself was malformed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The destination or the missing permission forbids the request.
    #[error("prohibited: {0}")]
    Prohibited(String),
}

impl ForwardRejection {
    /// RFC 4254 reason code for this rejection, used in log lines.
    ///
    /// It never reaches the client: russh 0.48 answers every refused open
    /// with `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`, and a failed dial closes
    /// a channel that was already accepted.
    pub fn reason_code(&self) -> ChannelOpenFailure {
        match self {
            ForwardRejection::ConnectFailed(_) => ChannelOpenFailure::ConnectFailed,
            ForwardRejection::Prohibited(_) => ChannelOpenFailure::AdministrativelyProhibited,
        }
    }
}
