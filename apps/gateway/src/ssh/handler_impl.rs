//! Handler trait implementation for SshHandler.

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::HashAlg;

use crate::error::GatewayError;

use super::handler::SshHandler;
use super::session::{render_banner, spawn_session};
use super::tunnel::spawn_tunnel;
use super::types::ForwardRequest;

#[async_trait]
impl Handler for SshHandler {
    type Error = GatewayError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        let permissions = self.state.engine.authorize(public_key).await;

        if !permissions.any_access() {
            info!(
                "[{}] Rejected key {} for user '{}' from {:?}",
                self.conn_id, fingerprint, user, self.peer_addr
            );
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        info!(
            "[{}] Accepted key {} for user '{}' (global: {})",
            self.conn_id,
            fingerprint,
            user,
            permissions.is_global()
        );
        self.permissions = Some(permissions);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.permissions.is_none() {
            return Ok(false);
        }
        debug!("[{}] Session channel opened: {:?}", self.conn_id, channel.id());
        self.sessions.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = ForwardRequest::new(
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        );

        // Policy only: the dial happens on the tunnel task so this callback
        // never holds up the connection.
        match self
            .state
            .gateway
            .authorize(&request, self.permissions.as_ref())
        {
            Ok(addr) => {
                info!(
                    "[{}] Forwarding {}:{} on channel {:?}",
                    self.conn_id, request.dest_addr, request.dest_port, channel.id()
                );
                spawn_tunnel(
                    channel,
                    session.handle(),
                    self.state.gateway.clone(),
                    addr,
                    self.conn_id.clone(),
                );
                Ok(true)
            }
            Err(rejection) => {
                warn!(
                    "[{}] Refused forward to {}:{} ({:?}): {}",
                    self.conn_id,
                    request.dest_addr,
                    request.dest_port,
                    rejection.reason_code(),
                    rejection
                );
                Ok(false)
            }
        }
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (Some(ch), Some(permissions)) = (self.sessions.remove(&channel), &self.permissions)
        else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        session.channel_success(channel)?;
        let banner = render_banner(&self.state.config, permissions);
        spawn_session(ch, session.handle(), banner, self.conn_id.clone());
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("[{}] Refusing exec on channel {:?}", self.conn_id, channel);
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("[{}] Refusing subsystem '{}'", self.conn_id, name);
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.sessions.remove(&channel);
        debug!("[{}] Channel {:?} closed", self.conn_id, channel);
        Ok(())
    }
}
