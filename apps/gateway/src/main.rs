//! WissKI SSH gateway
//!
//! Lets operators and instance users reach the SSH port of their WissKI
//! containers through one shared listener.
//!
//! ## Usage
//! ```bash
//! ssh -J wisski.example.org:2222 www-data@acme.wisski.example.org
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use tokio::net::TcpListener;

use wisski_gateway::{
    read_or_make_host_keys, run_internal_api, Config, GatewayServer, GatewayState,
    HostKeyAlgorithm,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so RUST_LOG can come from it.
    let dotenv = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!("Ignoring unreadable .env file: {}", e);
        }
    }

    info!("Starting WissKI SSH gateway...");

    let config = Config::from_env().context("invalid configuration")?;
    let keys = read_or_make_host_keys(&config.host_key_path, &HostKeyAlgorithm::DEFAULTS)
        .with_context(|| {
            format!(
                "failed to load host keys from '{}'",
                config.host_key_path.display()
            )
        })?;

    let ssh_config = russh::server::Config {
        methods: russh::MethodSet::PUBLICKEY,
        server_id: russh::SshId::Standard(format!(
            "SSH-2.0-wisski-gateway-{}",
            env!("CARGO_PKG_VERSION")
        )),
        keys,
        inactivity_timeout: Some(Duration::from_secs(1800)), // 30 minutes
        // Every attempt is already floored by the authorization engine.
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    };

    let ssh_addr = config.ssh_listen_addr.clone();
    let api_addr = config.internal_api_addr.clone();
    let state = Arc::new(GatewayState::from_config(config));
    let server = GatewayServer::new(state.clone());
    let listener = TcpListener::bind(&ssh_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {}", ssh_addr))?;

    info!("SSH listening on {}", ssh_addr);
    info!(
        "Instances reachable as <slug>.{} on port {}",
        state.config.primary_domain, state.config.advertised_ssh_port
    );

    tokio::select! {
        result = server.run(Arc::new(ssh_config), listener) => {
            result.context("SSH server failed")?;
        }
        result = run_internal_api(state.clone(), &api_addr) => {
            result.context("internal API failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}
