mod auth;
mod config;
mod connection;
mod dial;
mod forward;
mod policy;
mod proxy;
mod tls;
mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, ProxyConfig};
use crate::connection::ConnectionGuard;
use crate::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose {
        "fwdproxy=debug"
    } else {
        "fwdproxy=error"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    // Configuration errors are fatal here, before anything listens.
    let config = Arc::new(ProxyConfig::from_cli(args)?);
    let tls = tls::server_tls(&config).await?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(address = %config.listen_addr, tls = tls.is_some(), "server starting");
    debug!(
        read = ?config.server_read_timeout,
        write = ?config.server_write_timeout,
        idle = ?config.server_idle_timeout,
        "server-leg timeouts"
    );

    let proxy = Proxy::new(Arc::clone(&config));

    // Main server loop
    let server = async {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let proxy = proxy.clone();
                    let config = Arc::clone(&config);
                    let tls = tls.clone();
                    tokio::task::spawn(async move {
                        let _guard = ConnectionGuard::new();
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve(stream, proxy, &config, peer_addr).await,
                                Err(e) => warn!("TLS accept from {} failed: {}", peer_addr, e),
                            },
                            None => serve(stream, proxy, &config, peer_addr).await,
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    };

    // Run the server until the shutdown signal is received. Dropping the
    // accept loop closes the listener, so no new connections are admitted
    // while in-flight ones drain.
    tokio::select! {
        _ = server => {
            warn!("server loop terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    drain().await;
    info!("server stopped");
    Ok(())
}

/// Serve one client connection, plaintext or TLS-terminated.
async fn serve<IO>(io: IO, proxy: Proxy, config: &ProxyConfig, peer_addr: SocketAddr)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| proxy.clone().handle(req));

    if let Err(err) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(config.server_read_header_timeout)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        // Only log connection errors, not normal endings
        if !err.to_string().contains("connection closed") {
            warn!("connection from {} error: {:?}", peer_addr, err);
        }
    }
}

/// Wait for in-flight connections to finish, up to a fixed window.
async fn drain() {
    let active = ConnectionGuard::active_count();
    if active == 0 {
        return;
    }
    info!("waiting for {} connections to close...", active);

    for i in 1..=30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = ConnectionGuard::active_count();

        if remaining == 0 {
            info!("all connections closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!("still waiting for {} connections... ({}/30s)", remaining, i);
        }
    }

    warn!(
        "forced shutdown with {} connections still active",
        ConnectionGuard::active_count()
    );
}
