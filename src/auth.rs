use base64::engine::general_purpose;
use base64::Engine;

/// A username/password pair decoded from a `Proxy-Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// Parse an HTTP Basic `Proxy-Authorization` header value.
///
/// `"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="` yields `("Aladdin", "open sesame")`.
/// The value must start with the literal `"Basic "` prefix, the remainder must
/// be valid standard base64, and the decoded text must contain a colon. The
/// first colon splits username from password, so passwords may themselves
/// contain colons. Any violation yields `None`, never a partial credential.
pub fn parse_basic_proxy_auth(value: &str) -> Option<Credential> {
    const PREFIX: &str = "Basic ";

    let encoded = value.strip_prefix(PREFIX)?;
    let decoded = general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let split = decoded.find(':')?;

    Some(Credential::new(
        decoded[..split].to_string(),
        decoded[split + 1..].to_string(),
    ))
}
