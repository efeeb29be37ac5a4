use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Forward HTTP/HTTPS proxy",
    long_about = "fwdproxy accepts client connections, enforces optional Basic proxy \
authentication, and either forwards plain HTTP requests to the origin or opens a raw \
CONNECT tunnel for encrypted traffic.\n\nTLS for the proxy's own listener comes from \
static certificate files (--cert/--key) or automated issuance (--letsencrypt)."
)]
pub struct Cli {
    /// Filepath to certificate
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Filepath to private key
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Server listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Proxy authentication username (empty disables auth)
    #[arg(long, default_value = "")]
    pub user: String,

    /// Proxy authentication password (empty disables auth)
    #[arg(long, default_value = "")]
    pub pass: String,

    /// Block any request whose target host contains this substring
    #[arg(long)]
    pub avoid: Option<String>,

    /// Destination dial timeout in seconds
    #[arg(long = "dest-dial-timeout", default_value_t = 10)]
    pub dest_dial_timeout: u64,

    /// Destination read timeout in seconds
    #[arg(long = "dest-read-timeout", default_value_t = 5)]
    pub dest_read_timeout: u64,

    /// Destination write timeout in seconds
    #[arg(long = "dest-write-timeout", default_value_t = 5)]
    pub dest_write_timeout: u64,

    /// Client read timeout in seconds
    #[arg(long = "client-read-timeout", default_value_t = 5)]
    pub client_read_timeout: u64,

    /// Client write timeout in seconds
    #[arg(long = "client-write-timeout", default_value_t = 5)]
    pub client_write_timeout: u64,

    /// Server read timeout in seconds
    #[arg(long = "server-read-timeout", default_value_t = 30)]
    pub server_read_timeout: u64,

    /// Server read header timeout in seconds
    #[arg(long = "server-read-header-timeout", default_value_t = 30)]
    pub server_read_header_timeout: u64,

    /// Server write timeout in seconds
    #[arg(long = "server-write-timeout", default_value_t = 30)]
    pub server_write_timeout: u64,

    /// Server idle timeout in seconds
    #[arg(long = "server-idle-timeout", default_value_t = 30)]
    pub server_idle_timeout: u64,

    /// Set log level to DEBUG
    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Use automated certificate issuance (Let's Encrypt) for https
    #[arg(long, default_value_t = false)]
    pub letsencrypt: bool,

    /// Hostname to allow-list for automated certificate issuance
    #[arg(long = "le-whitelist")]
    pub le_whitelist: Option<String>,

    /// Cache directory for issued certificates
    #[arg(long = "le-cache-dir", default_value = "/tmp")]
    pub le_cache_dir: PathBuf,
}

/// TLS provisioning settings for the proxy's own listener
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub letsencrypt: bool,
    pub le_whitelist: Option<String>,
    pub le_cache_dir: PathBuf,
}

impl TlsSettings {
    fn from_cli(args: &Cli) -> Self {
        Self {
            cert_path: args.cert.clone(),
            key_path: args.key.clone(),
            letsencrypt: args.letsencrypt,
            le_whitelist: args.le_whitelist.clone(),
            le_cache_dir: args.le_cache_dir.clone(),
        }
    }

    /// Validate the TLS configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.letsencrypt
            && self
                .le_whitelist
                .as_ref()
                .map(|h| h.is_empty())
                .unwrap_or(true)
        {
            return Err("automated certificate mode requires --le-whitelist".to_string());
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err("--cert and --key must be supplied together".to_string());
        }
        if self.letsencrypt && self.cert_path.is_some() {
            return Err(
                "--letsencrypt and --cert/--key are mutually exclusive".to_string(),
            );
        }
        Ok(())
    }

    /// Whether the listener terminates TLS at all
    pub fn enabled(&self) -> bool {
        self.letsencrypt || self.cert_path.is_some()
    }
}

/// Proxy server configuration derived from CLI arguments.
///
/// Built once at startup and shared read-only across all connection tasks.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,

    pub auth_user: String,
    pub auth_pass: String,
    pub avoid: Option<String>,

    pub dest_dial_timeout: Duration,
    pub dest_read_timeout: Duration,
    pub dest_write_timeout: Duration,
    pub client_read_timeout: Duration,
    pub client_write_timeout: Duration,

    pub server_read_timeout: Duration,
    pub server_read_header_timeout: Duration,
    pub server_write_timeout: Duration,
    pub server_idle_timeout: Duration,

    pub tls: TlsSettings,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let tls = TlsSettings::from_cli(&args);
        tls.validate().map_err(|e| color_eyre::eyre::eyre!(e))?;

        let mut listen_addr = args.addr;
        if args.letsencrypt {
            // Automated issuance answers TLS-ALPN challenges, which only
            // arrive on the standard https port.
            listen_addr.set_port(443);
        }

        Ok(Self {
            listen_addr,
            auth_user: args.user,
            auth_pass: args.pass,
            avoid: args.avoid,
            dest_dial_timeout: Duration::from_secs(args.dest_dial_timeout),
            dest_read_timeout: Duration::from_secs(args.dest_read_timeout),
            dest_write_timeout: Duration::from_secs(args.dest_write_timeout),
            client_read_timeout: Duration::from_secs(args.client_read_timeout),
            client_write_timeout: Duration::from_secs(args.client_write_timeout),
            server_read_timeout: Duration::from_secs(args.server_read_timeout),
            server_read_header_timeout: Duration::from_secs(args.server_read_header_timeout),
            server_write_timeout: Duration::from_secs(args.server_write_timeout),
            server_idle_timeout: Duration::from_secs(args.server_idle_timeout),
            tls,
        })
    }

    /// Authentication is enforced only when both credentials are non-empty.
    /// An empty configured credential means auth is disabled, not that auth
    /// requires empty credentials.
    pub fn auth_enabled(&self) -> bool {
        !self.auth_user.is_empty() && !self.auth_pass.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("fwdproxy").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_flag_documentation() {
        let config = ProxyConfig::from_cli(parse(&[])).expect("valid config");

        assert_eq!(config.dest_dial_timeout, Duration::from_secs(10));
        assert_eq!(config.dest_read_timeout, Duration::from_secs(5));
        assert_eq!(config.client_write_timeout, Duration::from_secs(5));
        assert_eq!(config.server_idle_timeout, Duration::from_secs(30));
        assert!(!config.auth_enabled());
        assert!(!config.tls.enabled());
    }

    #[test]
    fn auth_requires_both_credentials() {
        let config = ProxyConfig::from_cli(parse(&["--user", "admin"])).expect("valid config");
        assert!(!config.auth_enabled());

        let config = ProxyConfig::from_cli(parse(&["--pass", "secret"])).expect("valid config");
        assert!(!config.auth_enabled());

        let config = ProxyConfig::from_cli(parse(&["--user", "admin", "--pass", "secret"]))
            .expect("valid config");
        assert!(config.auth_enabled());
    }

    #[test]
    fn letsencrypt_without_whitelist_is_fatal() {
        assert!(ProxyConfig::from_cli(parse(&["--letsencrypt"])).is_err());
    }

    #[test]
    fn letsencrypt_forces_https_port() {
        let config = ProxyConfig::from_cli(parse(&[
            "--letsencrypt",
            "--le-whitelist",
            "proxy.example.com",
        ]))
        .expect("valid config");

        assert_eq!(config.listen_addr.port(), 443);
        assert!(config.tls.enabled());
    }

    #[test]
    fn lone_cert_or_key_is_fatal() {
        assert!(ProxyConfig::from_cli(parse(&["--cert", "/tmp/server.pem"])).is_err());
        assert!(ProxyConfig::from_cli(parse(&["--key", "/tmp/server.key"])).is_err());
    }

    #[test]
    fn letsencrypt_and_static_certs_are_mutually_exclusive() {
        assert!(ProxyConfig::from_cli(parse(&[
            "--letsencrypt",
            "--le-whitelist",
            "proxy.example.com",
            "--cert",
            "/tmp/server.pem",
            "--key",
            "/tmp/server.key",
        ]))
        .is_err());
    }

    #[test]
    fn static_cert_pair_enables_tls() {
        let config = ProxyConfig::from_cli(parse(&[
            "--cert",
            "/tmp/server.pem",
            "--key",
            "/tmp/server.key",
        ]))
        .expect("valid config");

        assert!(config.tls.enabled());
        assert!(!config.tls.letsencrypt);
    }
}
