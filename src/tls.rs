use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use futures::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::ProxyConfig;

/// Build the listener's TLS acceptor from configuration.
///
/// Three mutually exclusive modes, selected at startup: automated
/// certificate issuance, static certificate files, or plaintext (`None`).
/// The dispatch and tunnel logic never sees which one was chosen.
pub async fn server_tls(config: &ProxyConfig) -> Result<Option<TlsAcceptor>> {
    let tls = &config.tls;
    if !tls.enabled() {
        return Ok(None);
    }

    if tls.letsencrypt {
        let host = tls
            .le_whitelist
            .clone()
            .ok_or_else(|| eyre!("automated certificate mode requires --le-whitelist"))?;
        return Ok(Some(acme_acceptor(host, tls.le_cache_dir.clone())));
    }

    match (&tls.cert_path, &tls.key_path) {
        (Some(cert), Some(key)) => Ok(Some(static_acceptor(cert, key)?)),
        // Unreachable once validation has run; treat as plaintext.
        _ => Ok(None),
    }
}

/// Acceptor backed by automated certificate issuance for one allow-listed
/// hostname. Issued certificates are cached in the configured directory and
/// renewed in the background; the issuing authority's terms are accepted
/// implicitly. TLS-ALPN challenges are answered through the cert resolver.
fn acme_acceptor(host: String, cache_dir: PathBuf) -> TlsAcceptor {
    let mut state = AcmeConfig::new(vec![host])
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(true)
        .state();

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(state.resolver());
    // http/1.1 only; HTTP/2 upgrade stays disabled.
    server_config.alpn_protocols = vec![
        rustls_acme::acme::ACME_TLS_ALPN_NAME.to_vec(),
        b"http/1.1".to_vec(),
    ];

    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => info!("certificate event: {:?}", event),
                Some(Err(err)) => warn!("certificate issuance error: {:?}", err),
                None => break,
            }
        }
    });

    TlsAcceptor::from(Arc::new(server_config))
}

/// Acceptor backed by a static PEM certificate chain and private key.
fn static_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(eyre!("no certificates found in {}", cert_path.display()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| eyre!("no private key found in {}", key_path.display()))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    // http/1.1 only; HTTP/2 upgrade stays disabled.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
