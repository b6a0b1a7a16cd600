//! Handshake primitives (RFC 6455 Section 4).
//!
//! Key computation, header token lists, and the HTTP/1.1 head codec used
//! when the handshake runs directly on a raw stream.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::header::{CONNECTION, HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use sha1::{Digest, Sha1};

use crate::error::{Error, HandshakeError, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WS_VERSION: &str = "13";

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
///
/// # Example
///
/// ```
/// use wsconn::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// let accept = compute_accept_key(key);
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Fresh random Sec-WebSocket-Key: 16 random bytes, base64 encoded.
///
/// # Errors
///
/// `Error::Io` if the OS random source is unavailable.
pub fn generate_challenge_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(format!("random source: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// A key is valid when it is base64 for exactly 16 bytes.
#[must_use]
pub fn is_valid_challenge_key(key: &str) -> bool {
    matches!(BASE64.decode(key.trim()), Ok(raw) if raw.len() == 16)
}

/// Comma-separated tokens of every `name` header, trimmed, empty ones skipped.
pub fn header_tokens(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Case-insensitive token membership.
pub fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    header_tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

/// Subprotocols requested by the client, in order.
///
/// ```
/// use http::HeaderMap;
/// use wsconn::protocol::handshake::subprotocols;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("sec-websocket-protocol", " foo, bar ".parse().unwrap());
/// assert_eq!(subprotocols(&headers), ["foo", "bar"]);
/// ```
#[must_use]
pub fn subprotocols(headers: &HeaderMap) -> Vec<String> {
    header_tokens(headers, SEC_WEBSOCKET_PROTOCOL)
        .map(str::to_string)
        .collect()
}

/// True if `Connection` contains `upgrade` and `Upgrade` contains `websocket`.
#[must_use]
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    has_token(headers, CONNECTION, "upgrade") && has_token(headers, UPGRADE, "websocket")
}

/// Replace control bytes so a value cannot split the response head.
#[must_use]
pub fn sanitize_header_value(value: &[u8]) -> Vec<u8> {
    value
        .iter()
        .map(|&b| if b <= 31 { b' ' } else { b })
        .collect()
}

/// Most header lines accepted in one handshake head.
pub const MAX_HEADERS: usize = 64;

fn header_map(parsed: &[httparse::Header<'_>]) -> std::result::Result<HeaderMap, &'static str> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name =
            HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| "invalid header name")?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| "invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parse the request head at the start of `buf`.
///
/// Returns `None` until the blank line that ends the head has arrived,
/// then the request and the offset of the first byte after the head.
///
/// # Errors
///
/// A 400 `HandshakeError` for anything that is not an HTTP/1.1 request head.
pub fn parse_request_head(
    buf: &[u8],
) -> std::result::Result<Option<(Request<()>, usize)>, HandshakeError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => {
            return Err(HandshakeError::bad_request(format!(
                "malformed request head: {err}"
            )));
        }
    };
    if parsed.version != Some(1) {
        return Err(HandshakeError::bad_request("unsupported HTTP version"));
    }
    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| HandshakeError::bad_request("invalid method"))?;
    let uri: Uri = parsed
        .path
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| HandshakeError::bad_request("invalid request target"))?;
    let headers = header_map(parsed.headers).map_err(HandshakeError::bad_request)?;

    let mut request = Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(Some((request, len)))
}

/// Parse the response head at the start of `buf`.
///
/// Returns `None` until the head is complete, like [`parse_request_head`].
///
/// # Errors
///
/// `Error::BadHandshake` for anything that is not an HTTP/1.1 response head.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(Response<()>, usize)>> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    let len = match parsed.parse(buf).map_err(|_| Error::BadHandshake)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    if parsed.version != Some(1) {
        return Err(Error::BadHandshake);
    }
    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(Error::BadHandshake)?;
    let headers = header_map(parsed.headers).map_err(|_| Error::BadHandshake)?;

    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.version_mut() = Version::HTTP_11;
    *response.headers_mut() = headers;
    Ok(Some((response, len)))
}

fn write_headers(headers: &HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(&sanitize_header_value(value.as_bytes()));
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

/// Serialize a response status line and headers.
pub fn write_response_head(status: StatusCode, headers: &HeaderMap, dst: &mut Vec<u8>) {
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    dst.extend_from_slice(b"\r\n");
    write_headers(headers, dst);
}

/// Serialize a request line and headers. The body is ignored.
pub fn write_request_head<B>(request: &Request<B>, dst: &mut Vec<u8>) {
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    dst.extend_from_slice(request.method().as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");
    write_headers(request.headers(), dst);
}
