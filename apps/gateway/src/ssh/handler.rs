//! Per-connection SSH handler state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::Msg;
use russh::{Channel, ChannelId};

use crate::state::GatewayState;

use super::types::PermissionMap;

/// Handler for a single SSH connection.
pub struct SshHandler {
    pub(super) state: Arc<GatewayState>,
    pub(super) peer_addr: Option<SocketAddr>,
    /// Short id tagging every log line of this connection
    pub(super) conn_id: String,
    /// Set once the engine accepted a key; read by every channel request
    pub(super) permissions: Option<PermissionMap>,
    /// Session channels waiting for a shell request
    pub(super) sessions: HashMap<ChannelId, Channel<Msg>>,
}

impl SshHandler {
    pub fn new(state: Arc<GatewayState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            conn_id: generate_conn_id(),
            permissions: None,
            sessions: HashMap::new(),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }
}

fn generate_conn_id() -> String {
    format!("ssh-{:08x}", rand::random::<u32>())
}
