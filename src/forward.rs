use bytes::Bytes;
use http::uri::PathAndQuery;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::client::conn::http1::Builder;
use hyper::header::{HeaderValue, HOST, USER_AGENT};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::warn;

use crate::config::ProxyConfig;
use crate::dial::dial_with_timeout;
use crate::proxy::status_response;

/// Headers meaningful only on the client-to-proxy leg. None of these may
/// reach the origin; `Proxy-Authorization` in particular would leak the
/// client's proxy credential.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Forward a plain-HTTP request to the origin named by its URI and stream
/// the origin's response back unmodified.
///
/// Dial and request failures surface to the client as gateway errors with
/// the underlying error text; nothing is retried.
pub async fn handle<B>(
    config: &ProxyConfig,
    mut req: Request<B>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let Some(host) = req.uri().host().map(str::to_string) else {
        warn!("HTTP request missing host: {:?}", req.uri());
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "HTTP request missing host",
        ));
    };
    let port = req.uri().port_u16().unwrap_or(80);
    let addr = format!("{}:{}", host, port);

    sanitize_request(&mut req);

    let stream = match dial_with_timeout(&addr, config.dest_dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("origin dial failed: {}", e);
            return Ok(status_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            warn!("origin connection error: {:?}", err);
        }
    });

    let resp = match tokio::time::timeout(config.dest_read_timeout, sender.send_request(req)).await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!("origin request failed: {}", e);
            return Ok(status_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
        Err(_) => {
            warn!(
                "origin response timed out after {:?}",
                config.dest_read_timeout
            );
            return Ok(status_response(
                StatusCode::GATEWAY_TIMEOUT,
                "origin response timeout",
            ));
        }
    };

    Ok(resp.map(|b| b.boxed()))
}

/// Rewrite the proxied request into what the origin should see: origin-form
/// request target, `Host` carried over from the authority, hop-by-hop
/// headers dropped, and an explicitly empty `User-Agent` when the client
/// sent none so the HTTP layer does not inject a default.
fn sanitize_request<B>(req: &mut Request<B>) {
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            if let Ok(value) = HeaderValue::try_from(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }

    for name in HOP_BY_HOP_HEADERS {
        req.headers_mut().remove(name);
    }

    if !req.headers().contains_key(USER_AGENT) {
        req.headers_mut().insert(USER_AGENT, HeaderValue::from_static(""));
    }

    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::builder()
        .path_and_query(path)
        .build()
        .unwrap_or_else(|_| Uri::from_static("/"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, ProxyConfig};
    use clap::Parser;
    use http_body_util::Empty;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> ProxyConfig {
        ProxyConfig::from_cli(Cli::parse_from(["fwdproxy"])).expect("default config")
    }

    fn absolute_request(uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("proxy-authorization", "Basic Zm9vOmJhcg==")
            .header("connection", "keep-alive")
            .header("content-type", "bar")
            .body(Empty::new())
            .expect("request")
    }

    #[test]
    fn sanitize_strips_hop_by_hop_and_sets_host() {
        let mut req = absolute_request("http://origin.example:8080/path?q=1");
        sanitize_request(&mut req);

        assert_eq!(req.uri(), &Uri::from_static("/path?q=1"));
        assert_eq!(
            req.headers().get(HOST).and_then(|v| v.to_str().ok()),
            Some("origin.example:8080")
        );
        assert!(!req.headers().contains_key("proxy-authorization"));
        assert!(!req.headers().contains_key("connection"));
        assert_eq!(
            req.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("bar")
        );
    }

    #[test]
    fn sanitize_forwards_absent_user_agent_as_empty() {
        let mut req = absolute_request("http://origin.example/");
        sanitize_request(&mut req);
        assert_eq!(
            req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()),
            Some("")
        );
    }

    #[test]
    fn sanitize_keeps_an_explicit_user_agent() {
        let mut req = absolute_request("http://origin.example/");
        req.headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        sanitize_request(&mut req);
        assert_eq!(
            req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()),
            Some("curl/8.0")
        );
    }

    #[test]
    fn sanitize_keeps_an_existing_host_header() {
        let mut req = absolute_request("http://origin.example/");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("other.example"));
        sanitize_request(&mut req);
        assert_eq!(
            req.headers().get(HOST).and_then(|v| v.to_str().ok()),
            Some("other.example")
        );
    }

    #[tokio::test]
    async fn forwards_request_and_streams_response_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        // Raw origin: capture the request head, answer with a fixed body.
        let origin = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                let n = sock.read(&mut buf[read..]).await.expect("read");
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 14\r\n\r\ndummy-response")
                .await
                .expect("write response");
            String::from_utf8_lossy(&buf[..read]).to_string()
        });

        let req = absolute_request(&format!("http://{}/hello?x=1", addr));
        let resp = handle(&test_config(), req).await.expect("forward");

        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(&body[..], b"dummy-response");

        let head = origin.await.expect("origin task").to_lowercase();
        assert!(head.starts_with("get /hello?x=1 http/1.1\r\n"));
        assert!(!head.contains("proxy-authorization"));
        assert!(head.contains("content-type: bar"));
        assert!(head.contains("user-agent:"));
        assert!(head.contains(&format!("host: {}", addr)));
    }

    #[tokio::test]
    async fn unreachable_origin_yields_bad_gateway_with_error_text() {
        // Grab a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let req = absolute_request(&format!("http://{}/", addr));
        let resp = handle(&test_config(), req).await.expect("forward");

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("dial tcp"), "body should carry the dial error: {text}");
    }
}
