//! Server side of the opening handshake.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderValue, ORIGIN, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION,
    UPGRADE,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::Config;
use crate::connection::{Connection, Negotiated, Role};
use crate::deadline::with_timeout;
use crate::error::{Error, HandshakeError, Result};
use crate::extensions::ExtensionOffer;
use crate::extensions::deflate::{self, NO_CONTEXT_TAKEOVER};
use crate::handshake::{Hijacked, read_head};
use crate::protocol::handshake::{
    WS_VERSION, compute_accept_key, has_token, header_tokens, is_valid_challenge_key,
    parse_request_head, subprotocols, write_response_head,
};

/// Origin policy: return `false` to reject the request with 403.
pub type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Renders a rejected handshake as an HTTP response.
pub type ErrorFormatter = Arc<dyn Fn(&HandshakeError) -> Response<String> + Send + Sync>;

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub subprotocol: Option<String>,
    pub compression: bool,
    /// `Sec-WebSocket-Accept` value for the request's key.
    pub accept_key: String,
}

impl HandshakeResult {
    #[must_use]
    pub fn negotiated(&self) -> Negotiated {
        Negotiated {
            subprotocol: self.subprotocol.clone(),
            compression: self.compression,
        }
    }

    /// Headers of the 101 response.
    ///
    /// `host_headers` are headers the host already set on its response;
    /// they are passed through, except `Sec-WebSocket-Protocol`.
    ///
    /// # Errors
    ///
    /// A 500 `HandshakeError` if the subprotocol is not a valid header value.
    pub fn response_headers(
        &self,
        host_headers: &HeaderMap,
    ) -> std::result::Result<HeaderMap, HandshakeError> {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, header_value(&self.accept_key)?);
        if let Some(protocol) = &self.subprotocol {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(protocol)?);
        }
        if self.compression {
            headers.insert(
                SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static(NO_CONTEXT_TAKEOVER),
            );
        }
        for (name, value) in host_headers {
            if name != SEC_WEBSOCKET_PROTOCOL {
                headers.append(name.clone(), value.clone());
            }
        }
        Ok(headers)
    }
}

fn header_value(value: &str) -> std::result::Result<HeaderValue, HandshakeError> {
    HeaderValue::from_str(value).map_err(|_| {
        HandshakeError::new(StatusCode::INTERNAL_SERVER_ERROR, "invalid response header value")
    })
}

/// Allow requests without `Origin`, or whose origin host equals `Host`.
#[must_use]
pub fn default_check_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    origin
        .to_str()
        .ok()
        .and_then(|o| o.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().map(|a| a.as_str().eq_ignore_ascii_case(host)))
        .unwrap_or(false)
}

/// Server-side upgrade policy.
///
/// ```rust,ignore
/// use wsconn::{Config, Upgrader};
///
/// let upgrader = Upgrader::new(Config::server())
///     .with_subprotocols(["chat", "superchat"])
///     .with_compression(true);
/// let conn = upgrader.accept(tcp_stream).await?;
/// ```
#[derive(Clone)]
pub struct Upgrader {
    config: Config,
    subprotocols: Option<Vec<String>>,
    compression: bool,
    check_origin: Option<OriginCheck>,
    error_formatter: Option<ErrorFormatter>,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new(Config::server())
    }
}

impl Upgrader {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            subprotocols: None,
            compression: false,
            check_origin: None,
            error_formatter: None,
        }
    }

    /// Supported subprotocols in order of preference.
    ///
    /// Without a list, a `Sec-WebSocket-Protocol` header preset by the host
    /// on its response is used as the selection.
    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    /// Negotiate permessage-deflate when the client offers it.
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn with_origin_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Some(Arc::new(check));
        self
    }

    #[must_use]
    pub fn with_error_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&HandshakeError) -> Response<String> + Send + Sync + 'static,
    {
        self.error_formatter = Some(Arc::new(formatter));
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate an upgrade request and negotiate its parameters.
    ///
    /// Checks run in order and the first failure is returned: method,
    /// `Connection`, `Upgrade`, version, key, origin, and finally
    /// extensions preset by the host (a server error).
    ///
    /// # Errors
    ///
    /// A `HandshakeError` carrying the status to answer with.
    pub fn negotiate<B>(
        &self,
        request: &Request<B>,
        response_headers: &HeaderMap,
    ) -> std::result::Result<HandshakeResult, HandshakeError> {
        let headers = request.headers();
        if request.method() != Method::GET {
            return Err(HandshakeError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "request method is not GET",
            ));
        }
        if !has_token(headers, CONNECTION, "upgrade") {
            return Err(HandshakeError::bad_request(
                "'upgrade' token not found in 'Connection' header",
            ));
        }
        if !has_token(headers, UPGRADE, "websocket") {
            return Err(HandshakeError::bad_request(
                "'websocket' token not found in 'Upgrade' header",
            ));
        }
        if !has_token(headers, SEC_WEBSOCKET_VERSION, WS_VERSION) {
            return Err(HandshakeError::bad_request(
                "unsupported version: 13 not found in 'Sec-WebSocket-Version' header",
            ));
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|k| k.to_str().ok())
            .map(str::trim)
            .filter(|k| is_valid_challenge_key(k))
            .ok_or_else(|| {
                HandshakeError::bad_request("'Sec-WebSocket-Key' header is missing or invalid")
            })?;
        let origin_ok = match &self.check_origin {
            Some(check) => check(headers),
            None => default_check_origin(headers),
        };
        if !origin_ok {
            return Err(HandshakeError::new(
                StatusCode::FORBIDDEN,
                "request origin not allowed",
            ));
        }
        if response_headers.contains_key(SEC_WEBSOCKET_EXTENSIONS) {
            return Err(HandshakeError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "application specific 'Sec-WebSocket-Extensions' headers are unsupported",
            ));
        }

        let compression =
            self.compression && deflate::negotiate(&ExtensionOffer::from_headers(headers));
        Ok(HandshakeResult {
            subprotocol: self.select_subprotocol(headers, response_headers),
            compression,
            accept_key: compute_accept_key(key),
        })
    }

    fn select_subprotocol(&self, request: &HeaderMap, response: &HeaderMap) -> Option<String> {
        match &self.subprotocols {
            Some(supported) => {
                let requested = subprotocols(request);
                supported.iter().find(|p| requested.contains(p)).cloned()
            }
            None => header_tokens(response, SEC_WEBSOCKET_PROTOCOL)
                .next()
                .map(str::to_string),
        }
    }

    /// Response for a rejected handshake, via the configured formatter.
    ///
    /// The default is a plain-text body with `Sec-WebSocket-Version: 13`.
    #[must_use]
    pub fn error_response(&self, err: &HandshakeError) -> Response<String> {
        if let Some(formatter) = &self.error_formatter {
            return formatter(err);
        }
        let mut response = Response::new(err.message.clone());
        *response.status_mut() = err.status;
        let headers = response.headers_mut();
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WS_VERSION));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Complete an upgrade on a stream taken over from the host.
    ///
    /// The request is validated first; `hijack` is only awaited once it
    /// passed, so on `Error::Handshake` the host still owns the exchange and
    /// should render [`Upgrader::error_response`]. After the 101 response is
    /// written the connection is handed to `handler`, and this call returns
    /// when the handler does.
    ///
    /// # Errors
    ///
    /// `Error::Handshake` for a rejected request, or the error of the hijack
    /// or of writing the 101 response (bounded by the handshake timeout).
    pub async fn upgrade<B, T, H, F, Fut>(
        &self,
        request: &Request<B>,
        response_headers: &HeaderMap,
        hijack: H,
        handler: F,
    ) -> Result<Fut::Output>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        H: Future<Output = Result<Hijacked<T>>>,
        F: FnOnce(Connection<T>) -> Fut,
        Fut: Future,
    {
        let result = self
            .negotiate(request, response_headers)
            .inspect_err(log_rejection)?;
        let head = response_head(&result, response_headers)?;
        let Hijacked { mut io, read_buf } = hijack.await?;
        with_timeout(self.config.handshake_timeout, async {
            io.write_all(&head).await?;
            io.flush().await?;
            Ok::<_, Error>(())
        })
        .await?;
        let conn = self.establish(io, &result, read_buf);
        Ok(handler(conn).await)
    }

    /// Run the handshake on a raw stream: read the request head, then write
    /// either the 101 response or the rendered rejection.
    ///
    /// # Errors
    ///
    /// `Error::Handshake` after a rejection was written,
    /// `Error::HandshakeTooLarge` for an oversized head, I/O errors and
    /// `Error::Timeout`.
    pub async fn accept<T>(&self, mut io: T) -> Result<Connection<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (result, read_buf) =
            with_timeout(self.config.handshake_timeout, self.accept_head(&mut io)).await?;
        Ok(self.establish(io, &result, read_buf))
    }

    async fn accept_head<T>(&self, io: &mut T) -> Result<(HandshakeResult, BytesMut)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let parsed = read_head(io, &mut buf, &self.config.limits, |head| {
            parse_request_head(head).map_err(Error::Handshake)
        })
        .await;
        let negotiated = match parsed {
            Ok(request) => self.negotiate(&request, &HeaderMap::new()),
            Err(err @ Error::HandshakeTooLarge { .. }) => {
                let rejection = HandshakeError::new(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "request head too large",
                );
                self.reject(io, &rejection).await?;
                return Err(err);
            }
            Err(Error::Handshake(rejection)) => Err(rejection),
            Err(err) => return Err(err),
        };
        match negotiated {
            Ok(result) => {
                let out = response_head(&result, &HeaderMap::new())?;
                io.write_all(&out).await?;
                io.flush().await?;
                Ok((result, buf))
            }
            Err(rejection) => {
                log_rejection(&rejection);
                self.reject(io, &rejection).await?;
                Err(Error::Handshake(rejection))
            }
        }
    }

    async fn reject<T>(&self, io: &mut T, rejection: &HandshakeError) -> Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        let response = self.error_response(rejection);
        let mut headers = response.headers().clone();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body().len()));
        let mut out = Vec::with_capacity(256 + response.body().len());
        write_response_head(response.status(), &headers, &mut out);
        out.extend_from_slice(response.body().as_bytes());
        io.write_all(&out).await?;
        io.flush().await?;
        Ok(())
    }

    fn establish<T>(&self, io: T, result: &HandshakeResult, read_buf: BytesMut) -> Connection<T>
    where
        T: AsyncRead + AsyncWrite,
    {
        debug!(
            subprotocol = result.subprotocol.as_deref().unwrap_or(""),
            compression = result.compression,
            "websocket upgrade accepted"
        );
        Connection::from_parts(io, Role::Server, &self.config, result.negotiated(), read_buf)
    }
}

fn response_head(result: &HandshakeResult, host_headers: &HeaderMap) -> Result<Vec<u8>> {
    let headers = result.response_headers(host_headers)?;
    let mut out = Vec::with_capacity(256);
    write_response_head(StatusCode::SWITCHING_PROTOCOLS, &headers, &mut out);
    Ok(out)
}

fn log_rejection(rejection: &HandshakeError) {
    debug!(
        status = rejection.status.as_u16(),
        reason = %rejection.message,
        "websocket upgrade rejected"
    );
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("config", &self.config)
            .field("subprotocols", &self.subprotocols)
            .field("compression", &self.compression)
            .field("check_origin", &self.check_origin.is_some())
            .field("error_formatter", &self.error_formatter.is_some())
            .finish()
    }
}
