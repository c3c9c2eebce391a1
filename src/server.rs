use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::{
    authorizer::Authorizer, config::Config, forwarder::Forwarder, identity, limiter::RateLimiter,
};

/// Outcome of the per-connection authorizer/limiter gate.
#[derive(Debug, PartialEq, Eq)]
pub enum GateResult {
    Admitted(Vec<String>),
    NoAllowList,
    RateLimited,
}

/// Decides whether a connection from `client_id` proceeds to the
/// forwarder. The authorizer is consulted before the limiter: an
/// unknown client (empty allow-list) is dropped without consuming a
/// rate-limit token, since it was never going anywhere regardless of
/// its rate.
pub fn connection_gate(authorizer: &Authorizer, limiter: &RateLimiter, client_id: &str) -> GateResult {
    let allowed = authorizer.lookup(client_id);
    if allowed.is_empty() {
        return GateResult::NoAllowList;
    }

    if !limiter.admit(client_id) {
        return GateResult::RateLimited;
    }

    GateResult::Admitted(allowed)
}

/// Wires together the TLS listener, authorizer, rate limiter, and
/// forwarder. Cloned cheaply (everything inside is an `Arc`) into one
/// task per accepted connection.
#[derive(Clone)]
pub struct Server {
    tls_acceptor: TlsAcceptor,
    authorizer: Arc<Authorizer>,
    limiter: Arc<RateLimiter>,
    forwarder: Arc<Forwarder>,
    listen: String,
}

impl Server {
    pub fn new(server_cfg: rustls::ServerConfig, app_cfg: &Config) -> Self {
        let authorizer = Arc::new(Authorizer::new());
        for (client, upstreams) in &app_cfg.clients {
            authorizer.register(client, upstreams.clone());
        }

        let limiter = Arc::new(RateLimiter::new(
            app_cfg.limiter.burst,
            app_cfg.limiter.rate,
        ));

        let forwarder = Arc::new(Forwarder::new(
            &app_cfg.upstreams,
            Duration::from_millis(app_cfg.dial_timeout_ms),
            Duration::from_secs(app_cfg.quarantine_window_secs),
        ));

        Server {
            tls_acceptor: TlsAcceptor::from(Arc::new(server_cfg)),
            authorizer,
            limiter,
            forwarder,
            listen: app_cfg.listen.clone(),
        }
    }

    /// Runs the accept loop until Ctrl-C is received.
    pub async fn run(&self) -> Result<()> {
        info!(listen = %self.listen, "starting forwarder");

        tokio::select! {
            res = self.accept_loop() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, closing forwarder");
                Ok(())
            }
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!(listen = %self.listen, "listening");

        loop {
            let (sock, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(sock, peer_addr).await;
            });
        }
    }

    async fn handle_connection(&self, raw_conn: TcpStream, peer_addr: std::net::SocketAddr) {
        let tls_stream = match self.tls_acceptor.accept(raw_conn).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                return;
            }
        };

        let client_id = match identity::client_identity(&tls_stream) {
            Ok(id) => id,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "could not determine client identity");
                return;
            }
        };

        let allowed = match connection_gate(&self.authorizer, &self.limiter, &client_id) {
            GateResult::Admitted(allowed) => allowed,
            GateResult::NoAllowList => {
                info!(client = %client_id, "no permitted upstreams, dropping connection");
                return;
            }
            GateResult::RateLimited => {
                info!(client = %client_id, "rate limited, dropping connection");
                return;
            }
        };

        info!(client = %client_id, peer = %peer_addr, "relaying connection");
        self.forwarder.relay(tls_stream, &allowed).await;
    }
}
