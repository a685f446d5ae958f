//! Banner-only interactive sessions.
//!
//! The gateway never provides a shell. A session prints how to use the
//! gateway as a jump host and waits for the user to hang up.

use log::debug;
use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::config::Config;

use super::types::PermissionMap;

/// End of text (CTRL-C).
const ETX: u8 = 0x03;
/// End of transmission (CTRL-D).
const EOT: u8 = 0x04;

const BANNER: &str = r"
__        ___         _  _____   ____       _
\ \      / (_)___ ___| |/ /_ _| / ___| __ _| |_ _____      ____ _ _   _
 \ \ /\ / /| / __/ __| ' / | | | |  _ / _` | __/ _ \ \ /\ / / _` | | | |
  \ V  V / | \__ \__ \ . \ | | | |_| | (_| | ||  __/\ V  V / (_| | |_| |
   \_/\_/  |_|___/___/_|\_\___| \____|\__,_|\__\___| \_/\_/ \__,_|\__, |
                                                                  |___/

Welcome to the WissKI SSH gateway.
You are authenticated, but this server does not provide a shell. Use it as a
jump host to reach the WissKI instances you have access to.

To connect to the instance ${SLUG} use:

ssh -J ${DOMAIN}:${PORT} www-data@${HOSTNAME}

More details:

${HELP_URL}

Press CTRL-C to close this connection.
";

/// Fill in the banner for a connection holding `permissions`.
pub fn render_banner(config: &Config, permissions: &PermissionMap) -> String {
    let slug = permissions.example_slug().unwrap_or_default();
    let port = config.advertised_ssh_port.to_string();
    let replacements = [
        ("${SLUG}", slug.to_string()),
        ("${HOSTNAME}", config.host_from_slug(slug)),
        ("${DOMAIN}", config.primary_domain.clone()),
        ("${PORT}", port),
        ("${HELP_URL}", config.help_url()),
    ];

    let banner = replacements
        .iter()
        .fold(BANNER.to_string(), |banner, (placeholder, value)| {
            banner.replace(placeholder, value)
        });
    banner.replace('\n', "\r\n")
}

/// Read from `input` until it ends, fails, or carries CTRL-C or CTRL-D.
pub async fn wait_for_interrupt<R: AsyncRead + Unpin>(mut input: R) {
    let mut buf = [0u8; 256];
    loop {
        match input.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) if buf[..n].iter().any(|b| *b == ETX || *b == EOT) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("Session input ended: {}", e);
                return;
            }
        }
    }
}

/// Serve a session channel: print the banner, wait, then close the channel.
pub fn spawn_session(channel: Channel<Msg>, handle: Handle, banner: String, conn_id: String) {
    let channel_id = channel.id();
    let mut stream = channel.into_stream();

    tokio::spawn(async move {
        if stream.write_all(banner.as_bytes()).await.is_ok() {
            let _ = stream.flush().await;
            wait_for_interrupt(&mut stream).await;
        }
        let _ = stream.shutdown().await;
        let _ = handle.close(channel_id).await;
        debug!("[{}] Session channel {:?} ended", conn_id, channel_id);
    });
}
