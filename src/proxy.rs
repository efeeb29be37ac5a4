use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, warn};

use crate::auth::parse_basic_proxy_auth;
use crate::config::ProxyConfig;
use crate::dial::dial_with_timeout;
use crate::policy::host_is_blocked;
use crate::{forward, tunnel};

/// The request dispatcher.
///
/// Applies proxy authentication and host-blocking policy to every request,
/// then routes it: plain-HTTP requests to the forwarding proxy, CONNECT
/// requests to the tunnel engine. Holds the process-wide configuration as an
/// explicit dependency; cloning is cheap and per-connection.
#[derive(Clone)]
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let authority = request_authority(&req);
        info!(host = %authority, "incoming request");

        if self.config.auth_enabled() && !self.authorized(req.headers()) {
            warn!("authorization attempt with invalid credentials");
            return Ok(proxy_auth_required());
        }

        if host_is_blocked(self.config.avoid.as_deref(), &authority) {
            // Status 405 with the 403 reason text, kept for wire compatibility.
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED, "Forbidden"));
        }

        if req.uri().scheme_str() == Some("http") {
            debug!(host = %authority, "got http request");
            forward::handle(&self.config, req).await
        } else {
            self.tunnel(req).await
        }
    }

    /// Exact match against the configured credential. Callers only learn
    /// pass/fail; nothing about the attempt is echoed back.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };

        match parse_basic_proxy_auth(value) {
            Some(cred) => {
                cred.username == self.config.auth_user && cred.password == self.config.auth_pass
            }
            None => false,
        }
    }

    async fn tunnel(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if req.method() != Method::CONNECT {
            info!(method = %req.method(), "method not allowed");
            return Ok(status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed",
            ));
        }

        let Some(addr) = req.uri().authority().map(|a| a.to_string()) else {
            warn!("CONNECT target is not host:port: {:?}", req.uri());
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "CONNECT must be to a socket address",
            ));
        };

        // The raw client transport must be claimable once the response goes
        // out; without that capability the request cannot be tunneled.
        if req.extensions().get::<OnUpgrade>().is_none() {
            error!("hijacking not supported");
            return Ok(status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Hijacking not supported",
            ));
        }

        debug!(host = %addr, "connecting");
        let dest = match dial_with_timeout(&addr, self.config.dest_dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("destination dial failed: {}", e);
                return Ok(status_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    e.to_string(),
                ));
            }
        };
        debug!(host = %addr, "connected");

        let deadlines = tunnel::Deadlines::starting_now(&self.config);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel::run(TokioIo::new(upgraded), dest, deadlines).await {
                        warn!(host = %addr, "tunnel error: {}", e);
                    }
                }
                Err(e) => warn!("upgrade error: {}", e),
            }
        });

        // The 200 goes out framed as HTTP before any raw bytes flow.
        Ok(Response::new(empty()))
    }
}

/// The authority the request targets, as policy sees it: the URI authority
/// (host:port) when present, the Host header otherwise.
fn request_authority<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.to_string();
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn status_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp
}

fn proxy_auth_required() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = status_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    resp.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"proxy\""),
    );
    resp
}
