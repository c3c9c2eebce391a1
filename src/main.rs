//! Binary entry-point for the least-connections mTLS TCP forwarder.

use anyhow::Result;
use least_conn_mtls_forwarder::{config, server, tls};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + YAML config ─────────────────────────────────────
    let (cli, cfg) = config::load_config()?;

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────
    // e.g. RUST_LOG=debug cargo run
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("configuration loaded from {:?}", cli.config);
    info!(listen = %cfg.listen, upstreams = cfg.upstreams.len(), clients = cfg.clients.len(), "forwarder configured");

    // ── 3. Build TLS config and run the server ──────────────────────────────
    let server_cfg = tls::build_server_config(&cfg.tls)?;
    let server = server::Server::new(server_cfg, &cfg);

    if let Err(e) = server.run().await {
        error!("forwarder exited with error: {:?}", e);
        return Err(e);
    }

    Ok(())
}
