//! SSH server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use russh::server::Server;
use tokio::net::TcpListener;

use super::SshHandler;
use crate::error::GatewayError;
use crate::state::GatewayState;

/// Creates a handler for each accepted connection.
#[derive(Clone)]
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

/// How a connection ended.
#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    Closed,
    Failed(String),
    Panicked,
}

impl GatewayServer {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Accept connections on `listener` until accepting fails, serving each
    /// on its own task.
    pub async fn run(
        mut self,
        config: Arc<russh::server::Config>,
        listener: TcpListener,
    ) -> std::io::Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
            }

            let handler = self.new_client(Some(peer_addr));
            let conn_id = handler.conn_id().to_string();
            let config = config.clone();

            tokio::spawn(supervise(conn_id, async move {
                let session = russh::server::run_stream(config, socket, handler).await?;
                session.await
            }));
        }
    }
}

/// Run one connection on its own task and log how it ended.
///
/// A panic anywhere in the connection's handler only takes down that
/// connection.
async fn supervise<F>(conn_id: String, connection: F) -> ConnectionEnd
where
    F: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    let end = match tokio::spawn(connection).await {
        Ok(Ok(())) => ConnectionEnd::Closed,
        Ok(Err(e)) => ConnectionEnd::Failed(e.to_string()),
        Err(e) if e.is_panic() => ConnectionEnd::Panicked,
        Err(e) => ConnectionEnd::Failed(e.to_string()),
    };

    match &end {
        ConnectionEnd::Closed => info!("[{}] Connection closed", conn_id),
        ConnectionEnd::Failed(reason) => warn!("[{}] Session error: {}", conn_id, reason),
        ConnectionEnd::Panicked => {
            error!("[{}] Connection handler panicked, disconnected", conn_id)
        }
    }
    end
}

impl Server for GatewayServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let handler = SshHandler::new(self.state.clone(), peer_addr);
        info!("[{}] New SSH connection from {:?}", handler.conn_id(), peer_addr);
        handler
    }
}
