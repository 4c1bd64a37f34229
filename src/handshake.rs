//! # Opening handshake
//!
//! The HTTP/1.1 upgrade exchange of [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4).
//!
//! Only as much HTTP as the upgrade needs is understood here: a request or status line, headers,
//! and the blank line ending the head. Heads are parsed with `httparse`, and parsing reports how
//! many bytes the head took so that anything the peer sent after it is kept for the frame
//! decoder.
//!
//! Client side: [`ClientRequest`] writes the request and [`verify_response`] checks the answer.
//! Server side: [`parse_request`] and [`validate_request`] check the request,
//! [`build_response`] answers it and [`build_rejection`] turns it down.
use base64::prelude::*;
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

use crate::{Result, WebSocketError};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Upper bound on the number of header lines in a head.
pub const MAX_HEADERS: usize = 64;

/// Upper bound on the size of a head, in bytes.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Why an opening handshake failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The server answered with something other than `101 Switching Protocols`.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),
    /// `Upgrade` is missing or is not `websocket`.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,
    /// `Connection` is missing or does not contain `Upgrade`.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,
    /// `Sec-WebSocket-Accept` does not match the key that was sent.
    #[error("Invalid Sec-WebSocket-Accept")]
    InvalidAccept,
    /// The server picked a subprotocol that was never offered.
    #[error("Unsupported subprotocol: {0}")]
    UnsupportedProtocol(String),
    /// The request has no usable `Sec-WebSocket-Key`.
    #[error("Missing Sec-WebSocket-Key")]
    MissingKey,
    /// The request asks for a protocol version other than 13.
    #[error("Invalid Sec-WebSocket-Version")]
    InvalidVersion,
    /// The request method is not `GET`.
    #[error("Invalid method: {0}")]
    InvalidMethod(String),
    /// The head is not valid HTTP/1.1.
    #[error("Malformed HTTP head: {0}")]
    Malformed(String),
    /// The head grew beyond [`MAX_HEAD_SIZE`] or [`MAX_HEADERS`].
    #[error("HTTP head too large")]
    HeadersTooLarge,
}

impl HandshakeError {
    /// HTTP status a server answers this error with.
    pub fn status_code(&self) -> u16 {
        match self {
            HandshakeError::InvalidVersion => 426,
            HandshakeError::HeadersTooLarge => 431,
            _ => 400,
        }
    }
}

/// `base64(SHA1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Header lines of a parsed head, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name` joined with `", "`, the way repeated list headers combine.
    pub fn get_all(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    /// Whether the comma-separated list in `name` contains `token`, ignoring case.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn collect(headers: &[httparse::Header<'_>]) -> std::result::Result<Self, HandshakeError> {
        headers
            .iter()
            .map(|header| {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| HandshakeError::Malformed(format!("header {}", header.name)))?;
                Ok((header.name.to_owned(), value.trim().to_owned()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Self)
    }
}

fn comma_list(value: Option<&str>) -> Vec<String> {
    value
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn partial_or_too_large<T>(buf: &[u8]) -> std::result::Result<Option<T>, HandshakeError> {
    if buf.len() > MAX_HEAD_SIZE {
        Err(HandshakeError::HeadersTooLarge)
    } else {
        Ok(None)
    }
}

fn parse_error(err: httparse::Error) -> HandshakeError {
    match err {
        httparse::Error::TooManyHeaders => HandshakeError::HeadersTooLarge,
        err => HandshakeError::Malformed(err.to_string()),
    }
}

// ======== client side =============

/// The client's upgrade request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    host: String,
    path: String,
    key: String,
    protocols: Vec<String>,
    extensions: Option<String>,
    origin: Option<String>,
    cookies: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl ClientRequest {
    /// Prepares a request for a `ws://` or `wss://` URL with a freshly generated key.
    pub fn new(url: &Url) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::InvalidHttpScheme);
        }
        let host = url
            .host_str()
            .ok_or(WebSocketError::InvalidArgument("url has no host"))?;

        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self {
            host,
            path: url[url::Position::BeforePath..url::Position::AfterQuery].to_owned(),
            key: generate_key(),
            protocols: Vec::new(),
            extensions: None,
            origin: None,
            cookies: Vec::new(),
            headers: Vec::new(),
        })
    }

    /// Subprotocols to offer, in order of preference.
    pub fn with_protocols(
        mut self,
        protocols: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Value of the `Sec-WebSocket-Extensions` header.
    pub fn with_extensions(mut self, offer: impl Into<String>) -> Self {
        self.extensions = Some(offer.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Adds an arbitrary header, e.g. `Authorization`.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The `Sec-WebSocket-Key` this request carries.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The subprotocols offered.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Serializes the head, CRLF line endings included.
    pub fn encode(&self) -> String {
        let mut head = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n",
            self.path, self.host, self.key
        );
        if !self.protocols.is_empty() {
            head.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", self.protocols.join(", ")));
        }
        if let Some(extensions) = &self.extensions {
            head.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
        }
        if let Some(origin) = &self.origin {
            head.push_str(&format!("Origin: {origin}\r\n"));
        }
        if !self.cookies.is_empty() {
            let cookies: Vec<String> = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            head.push_str(&format!("Cookie: {}\r\n", cookies.join("; ")));
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        head
    }
}

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
}

/// Parses a response head.
///
/// # Returns
/// - `Ok(None)` while the head is incomplete.
/// - `Ok(Some((response, len)))` once it is complete, `len` being the size of the head. Bytes
///   after it already belong to the WebSocket stream.
pub fn parse_response(
    buf: &[u8],
) -> std::result::Result<Option<(Response, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf).map_err(parse_error)? {
        httparse::Status::Partial => partial_or_too_large(buf),
        httparse::Status::Complete(len) => {
            let status = response
                .code
                .ok_or_else(|| HandshakeError::Malformed("missing status".to_owned()))?;
            let headers = Headers::collect(response.headers)?;
            Ok(Some((Response { status, headers }, len)))
        }
    }
}

/// Checks the server's response to `request`.
///
/// # Returns
/// The subprotocol the server selected, if any. Extension agreement is checked separately
/// against the `Sec-WebSocket-Extensions` header.
pub fn verify_response(
    response: &Response,
    request: &ClientRequest,
) -> std::result::Result<Option<String>, HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::InvalidStatusCode(response.status));
    }

    let headers = &response.headers;
    if !headers
        .get("Upgrade")
        .is_some_and(|h| h.eq_ignore_ascii_case("websocket"))
    {
        return Err(HandshakeError::InvalidUpgradeHeader);
    }
    if !headers.contains_token("Connection", "Upgrade") {
        return Err(HandshakeError::InvalidConnectionHeader);
    }
    if headers.get("Sec-WebSocket-Accept") != Some(compute_accept_key(&request.key).as_str()) {
        return Err(HandshakeError::InvalidAccept);
    }

    match headers.get("Sec-WebSocket-Protocol") {
        None => Ok(None),
        Some(protocol) if request.protocols.iter().any(|p| p == protocol) => {
            Ok(Some(protocol.to_owned()))
        }
        Some(protocol) => Err(HandshakeError::UnsupportedProtocol(protocol.to_owned())),
    }
}

// ======== server side =============

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Headers,
}

/// Parses a request head. Same contract as [`parse_response`].
pub fn parse_request(buf: &[u8]) -> std::result::Result<Option<(Request, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf).map_err(parse_error)? {
        httparse::Status::Partial => partial_or_too_large(buf),
        httparse::Status::Complete(len) => {
            let (Some(method), Some(path)) = (request.method, request.path) else {
                return Err(HandshakeError::Malformed("missing request line".to_owned()));
            };
            let parsed = Request {
                method: method.to_owned(),
                path: path.to_owned(),
                headers: Headers::collect(request.headers)?,
            };
            Ok(Some((parsed, len)))
        }
    }
}

/// What a valid upgrade request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: String,
    pub path: String,
    pub protocols: Vec<String>,
    pub extensions: Option<String>,
    pub origin: Option<String>,
}

/// Checks an upgrade request.
pub fn validate_request(request: &Request) -> std::result::Result<UpgradeRequest, HandshakeError> {
    if request.method != "GET" {
        return Err(HandshakeError::InvalidMethod(request.method.clone()));
    }

    let headers = &request.headers;
    if !headers.contains_token("Upgrade", "websocket") {
        return Err(HandshakeError::InvalidUpgradeHeader);
    }
    if !headers.contains_token("Connection", "Upgrade") {
        return Err(HandshakeError::InvalidConnectionHeader);
    }
    if headers.get("Sec-WebSocket-Version") != Some(WEBSOCKET_VERSION) {
        return Err(HandshakeError::InvalidVersion);
    }

    // the key must decode to exactly 16 bytes
    let key = headers
        .get("Sec-WebSocket-Key")
        .filter(|key| {
            BASE64_STANDARD
                .decode(key)
                .is_ok_and(|decoded| decoded.len() == 16)
        })
        .ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest {
        key: key.to_owned(),
        path: request.path.clone(),
        protocols: comma_list(headers.get_all("Sec-WebSocket-Protocol").as_deref()),
        extensions: headers.get_all("Sec-WebSocket-Extensions"),
        origin: headers.get("Origin").map(str::to_owned),
    })
}

/// Picks the first protocol the client offered that the server supports.
pub fn select_protocol(offered: &[String], supported: &[String]) -> Option<String> {
    offered
        .iter()
        .find(|protocol| supported.contains(protocol))
        .cloned()
}

/// The `101 Switching Protocols` head answering `key`.
pub fn build_response(key: &str, protocol: Option<&str>, extensions: Option<&str>) -> String {
    let mut head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        compute_accept_key(key)
    );
    if let Some(protocol) = protocol {
        head.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    if let Some(extensions) = extensions {
        head.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// The error response a server sends before dropping a failed upgrade.
pub fn build_rejection(err: &HandshakeError) -> String {
    let (status, reason) = match err.status_code() {
        426 => (426, "Upgrade Required"),
        431 => (431, "Request Header Fields Too Large"),
        _ => (400, "Bad Request"),
    };
    let body = err.to_string();
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(url: &str) -> ClientRequest {
        ClientRequest::new(&url.parse().unwrap()).unwrap()
    }

    fn respond(request: &ClientRequest, extra: &str) -> Response {
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n{extra}\r\n",
            compute_accept_key(request.key())
        );
        parse_response(head.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn test_accept_key_vector() {
        assert_eq!(compute_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_client_request_head() {
        let req = request("ws://example.com:9001/chat?room=1")
            .with_protocols(["chat", "superchat"])
            .with_extensions("permessage-deflate; client_max_window_bits")
            .with_origin("http://example.com")
            .with_cookie("session", "abc")
            .with_cookie("theme", "dark")
            .with_header("Authorization", "Bearer token");
        let head = req.encode();

        assert!(head.starts_with("GET /chat?room=1 HTTP/1.1\r\nHost: example.com:9001\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(head.contains(&format!("Sec-WebSocket-Key: {}\r\n", req.key())));
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(head.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(
            head.contains("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n")
        );
        assert!(head.contains("Origin: http://example.com\r\n"));
        assert!(head.contains("Cookie: session=abc; theme=dark\r\n"));
        assert!(head.contains("Authorization: Bearer token\r\n"));
        assert!(head.ends_with("\r\n\r\n"));

        // the server side accepts what the client writes
        let (parsed, len) = parse_request(head.as_bytes()).unwrap().unwrap();
        assert_eq!(len, head.len());
        let upgrade = validate_request(&parsed).unwrap();
        assert_eq!(upgrade.key, req.key());
        assert_eq!(upgrade.path, "/chat?room=1");
        assert_eq!(upgrade.protocols, vec!["chat", "superchat"]);
    }

    #[test]
    fn test_invalid_scheme() {
        let url: Url = "http://example.com".parse().unwrap();
        assert!(matches!(
            ClientRequest::new(&url),
            Err(WebSocketError::InvalidHttpScheme)
        ));
    }

    #[test]
    fn test_verify_response() {
        let req = request("ws://localhost/").with_protocols(["chat"]);
        assert_eq!(verify_response(&respond(&req, ""), &req), Ok(None));
        assert_eq!(
            verify_response(&respond(&req, "Sec-WebSocket-Protocol: chat\r\n"), &req),
            Ok(Some("chat".to_owned()))
        );
        assert_eq!(
            verify_response(&respond(&req, "Sec-WebSocket-Protocol: mqtt\r\n"), &req),
            Err(HandshakeError::UnsupportedProtocol("mqtt".to_owned()))
        );
    }

    #[test]
    fn test_verify_response_failures() {
        let req = request("ws://localhost/");
        let parse = |head: &str| parse_response(head.as_bytes()).unwrap().unwrap().0;
        let accept = compute_accept_key(req.key());

        let not_switching = parse("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            verify_response(&not_switching, &req),
            Err(HandshakeError::InvalidStatusCode(200))
        );

        let bad_upgrade = parse(&format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: h2c\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        ));
        assert_eq!(
            verify_response(&bad_upgrade, &req),
            Err(HandshakeError::InvalidUpgradeHeader)
        );

        let bad_connection = parse(&format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: keep-alive\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        ));
        assert_eq!(
            verify_response(&bad_connection, &req),
            Err(HandshakeError::InvalidConnectionHeader)
        );

        let bad_accept = parse(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        assert_eq!(
            verify_response(&bad_accept, &req),
            Err(HandshakeError::InvalidAccept)
        );
    }

    #[test]
    fn test_partial_head_and_leftover_bytes() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert_eq!(parse_response(head.as_bytes()), Ok(None));

        let mut full = format!("{head}Connection: Upgrade\r\n\r\n").into_bytes();
        let head_len = full.len();
        full.extend_from_slice(&[0x81, 0x00]);
        let (_, len) = parse_response(&full).unwrap().unwrap();
        assert_eq!(len, head_len);
        assert_eq!(&full[len..], &[0x81, 0x00]);
    }

    #[test]
    fn test_oversized_head() {
        let mut head = b"GET / HTTP/1.1\r\n".to_vec();
        while head.len() <= MAX_HEAD_SIZE {
            head.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        assert_eq!(parse_request(&head), Err(HandshakeError::HeadersTooLarge));
    }

    #[test]
    fn test_validate_request_failures() {
        let parse = |head: &str| parse_request(head.as_bytes()).unwrap().unwrap().0;
        let base = "Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n";

        let post = parse(&format!(
            "POST / HTTP/1.1\r\n{base}Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
        ));
        assert_eq!(
            validate_request(&post),
            Err(HandshakeError::InvalidMethod("POST".to_owned()))
        );

        let no_key = parse(&format!("GET / HTTP/1.1\r\n{base}\r\n"));
        assert_eq!(validate_request(&no_key), Err(HandshakeError::MissingKey));

        let short_key = parse(&format!("GET / HTTP/1.1\r\n{base}Sec-WebSocket-Key: YWJj\r\n\r\n"));
        assert_eq!(validate_request(&short_key), Err(HandshakeError::MissingKey));

        let old_version = parse(&format!(
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
        ));
        let err = validate_request(&old_version).unwrap_err();
        assert_eq!(err, HandshakeError::InvalidVersion);
        assert_eq!(err.status_code(), 426);

        let plain_http = parse("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(
            validate_request(&plain_http),
            Err(HandshakeError::InvalidUpgradeHeader)
        );
    }

    #[test]
    fn test_server_response_and_rejection() {
        let head = build_response(SAMPLE_KEY, Some("chat"), Some("permessage-deflate"));
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));

        let rejection = build_rejection(&HandshakeError::InvalidVersion);
        assert!(rejection.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(rejection.contains("Sec-WebSocket-Version: 13\r\n"));

        let rejection = build_rejection(&HandshakeError::MissingKey);
        assert!(rejection.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_select_protocol_prefers_client_order() {
        let offered = vec!["b".to_owned(), "a".to_owned()];
        let supported = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(select_protocol(&offered, &supported), Some("b".to_owned()));
        assert_eq!(select_protocol(&offered, &[]), None);
    }

    #[test]
    fn test_header_lookup() {
        let head = "GET / HTTP/1.1\r\nSec-WebSocket-Protocol: a, b\r\nsec-websocket-protocol: c\r\n\r\n";
        let (request, _) = parse_request(head.as_bytes()).unwrap().unwrap();
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.headers.get("SEC-WEBSOCKET-PROTOCOL"), Some("a, b"));
        assert_eq!(
            comma_list(request.headers.get_all("Sec-WebSocket-Protocol").as_deref()),
            vec!["a", "b", "c"]
        );
    }
}
