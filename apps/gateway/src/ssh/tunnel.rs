//! `direct-tcpip` forwarding into instance containers.
//!
//! This is the security boundary of the gateway: the only reachable
//! destination is port 22 of an instance the connection was authorized for.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::config::{is_valid_slug, Config, INTERNAL_HOST_SUFFIX};

use super::types::{ForwardRejection, ForwardRequest, PermissionMap};

/// The only port that may be forwarded to.
pub const FORWARD_PORT: u32 = 22;

/// Maps an instance slug onto the address of its SSH backend.
pub trait BackendResolver: Send + Sync {
    fn backend_addr(&self, slug: &str) -> String;
}

/// Backends reachable on the internal docker network as
/// `<slug>.<primary-domain>.wisski:22`.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    primary_domain: String,
}

impl DockerBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            primary_domain: config.primary_domain.clone(),
        }
    }
}

impl BackendResolver for DockerBackend {
    fn backend_addr(&self, slug: &str) -> String {
        format!(
            "{}.{}{}:{}",
            slug, self.primary_domain, INTERNAL_HOST_SUFFIX, FORWARD_PORT
        )
    }
}

/// Validates forward requests and connects them to their backend.
#[derive(Clone)]
pub struct ForwardingGateway {
    config: Arc<Config>,
    backends: Arc<dyn BackendResolver>,
    dial_timeout: Duration,
}

impl ForwardingGateway {
    pub fn new(config: Arc<Config>, backends: Arc<dyn BackendResolver>) -> Self {
        let dial_timeout = config.dial_timeout;
        Self {
            config,
            backends,
            dial_timeout,
        }
    }

    /// Decide where `request` may go. Returns the backend address.
    ///
    /// A connection without permissions (not authenticated by the engine)
    /// is treated like one without any access.
    pub fn authorize(
        &self,
        request: &ForwardRequest,
        permissions: Option<&PermissionMap>,
    ) -> Result<String, ForwardRejection> {
        let slug = self
            .config
            .slug_from_host(&request.dest_addr)
            .filter(|slug| is_valid_slug(slug))
            .ok_or_else(|| {
                ForwardRejection::Prohibited(format!("unknown host '{}'", request.dest_addr))
            })?;

        if request.dest_port != FORWARD_PORT {
            return Err(ForwardRejection::Prohibited(format!(
                "only port {} can be forwarded",
                FORWARD_PORT
            )));
        }

        if !permissions.is_some_and(|p| p.grants(&slug)) {
            return Err(ForwardRejection::Prohibited("permission denied".to_string()));
        }

        Ok(self.backends.backend_addr(&slug))
    }

    /// Connect to a backend, giving up after the dial timeout.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, ForwardRejection> {
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ForwardRejection::ConnectFailed(e.to_string())),
            Err(_) => Err(ForwardRejection::ConnectFailed(format!(
                "timed out after {:?} connecting to {}",
                self.dial_timeout, addr
            ))),
        }
    }
}

/// Client bytes that arrived on a channel before its backend answered.
#[derive(Debug, Default)]
struct EarlyData {
    data: Vec<u8>,
    eof: bool,
}

enum Dialed {
    Connected(TcpStream, EarlyData),
    Failed(ForwardRejection),
    /// The channel or the whole connection went away first.
    Abandoned,
}

/// Dial `addr` while draining the channel, so a close or disconnect drops the
/// attempt and nothing the client sent in the meantime is lost.
async fn dial_while_open(
    gateway: &ForwardingGateway,
    addr: &str,
    channel: &mut Channel<Msg>,
) -> Dialed {
    let dial = gateway.dial(addr);
    tokio::pin!(dial);
    let mut early = EarlyData::default();

    loop {
        tokio::select! {
            result = &mut dial => {
                return match result {
                    Ok(stream) => Dialed::Connected(stream, early),
                    Err(rejection) => Dialed::Failed(rejection),
                };
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => early.data.extend_from_slice(&data),
                Some(ChannelMsg::Eof) => early.eof = true,
                Some(ChannelMsg::Close) | None => return Dialed::Abandoned,
                Some(_) => {}
            },
        }
    }
}

/// Connect an accepted channel to `addr` and pump data until either side
/// ends, then close the channel.
///
/// The dial runs here rather than in the channel-open callback, which would
/// stall every other channel of the connection until it finished. When the
/// backend cannot be reached the already accepted channel gets EOF and close.
pub fn spawn_tunnel(
    mut channel: Channel<Msg>,
    handle: Handle,
    gateway: ForwardingGateway,
    addr: String,
    conn_id: String,
) {
    let channel_id = channel.id();

    tokio::spawn(async move {
        debug!("[{}] Dialing backend {} for channel {:?}", conn_id, addr, channel_id);
        let (backend, early) = match dial_while_open(&gateway, &addr, &mut channel).await {
            Dialed::Connected(backend, early) => (backend, early),
            Dialed::Failed(rejection) => {
                warn!(
                    "[{}] Backend {} for channel {:?} unreachable ({:?}): {}",
                    conn_id,
                    addr,
                    channel_id,
                    rejection.reason_code(),
                    rejection
                );
                let _ = channel.eof().await;
                let _ = channel.close().await;
                return;
            }
            Dialed::Abandoned => {
                debug!(
                    "[{}] Channel {:?} closed before {} answered",
                    conn_id, channel_id, addr
                );
                return;
            }
        };

        let (channel_read, channel_write) = tokio::io::split(channel.into_stream());
        let early_read = Cursor::new(early.data);
        let channel_read: Box<dyn AsyncRead + Send + Unpin> = if early.eof {
            Box::new(early_read)
        } else {
            Box::new(early_read.chain(channel_read))
        };
        let (backend_read, backend_write) = backend.into_split();

        match splice(channel_read, channel_write, backend_read, backend_write).await {
            Ok((upstream, downstream)) => info!(
                "[{}] Tunnel on channel {:?} closed ({} bytes up, {} bytes down)",
                conn_id, channel_id, upstream, downstream
            ),
            Err(e) => error!(
                "[{}] Tunnel on channel {:?} failed: {}",
                conn_id, channel_id, e
            ),
        }
        // Already closed when the client went away first.
        let _ = handle.close(channel_id).await;
    });
}

/// Copy `a` to `b` and `b` to `a` on two tasks. When either direction ends,
/// the other one is stopped and both write halves are shut down.
///
/// Returns the bytes copied in each direction, or the error of a copy task
/// that panicked.
pub async fn splice<AR, AW, BR, BW>(
    a_read: AR,
    a_write: AW,
    b_read: BR,
    b_write: BW,
) -> Result<(u64, u64), JoinError>
where
    AR: AsyncRead + Unpin + Send + 'static,
    AW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);

    let forward = tokio::spawn(copy_until_closed(
        a_read,
        b_write,
        closed_tx.clone(),
        closed_rx.clone(),
    ));
    let backward = tokio::spawn(copy_until_closed(b_read, a_write, closed_tx, closed_rx));

    let (forward, backward) = tokio::join!(forward, backward);
    Ok((forward?, backward?))
}

/// Raises the shared close signal when dropped, including during a panic.
struct CloseOnDrop(Arc<watch::Sender<bool>>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    closed_tx: Arc<watch::Sender<bool>>,
    mut closed_rx: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let closed = CloseOnDrop(closed_tx);
    let copied = tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(n) => n,
            Err(e) => {
                debug!("Tunnel copy ended: {}", e);
                0
            }
        },
        _ = closed_rx.wait_for(|closed| *closed) => 0,
    };

    drop(closed);
    let _ = writer.shutdown().await;
    copied
}
