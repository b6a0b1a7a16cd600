//! Client side of the opening handshake.

use bytes::BytesMut;
use http::header::{
    CONNECTION, HOST, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Request, Response, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::Config;
use crate::connection::{Connection, Negotiated, Role};
use crate::deadline::with_timeout;
use crate::error::{Error, Result};
use crate::extensions::ExtensionOffer;
use crate::extensions::deflate::{self, NO_CONTEXT_TAKEOVER, PERMESSAGE_DEFLATE};
use crate::handshake::{Hijacked, read_head};
use crate::protocol::handshake::{
    WS_VERSION, compute_accept_key, generate_challenge_key, has_token, parse_response_head,
    write_request_head,
};

/// Client-side upgrade policy.
///
/// ```rust,ignore
/// use wsconn::{ClientUpgrader, Config};
///
/// let client = ClientUpgrader::new(Config::client()).with_compression(true);
/// let (conn, response) = client.connect(tcp_stream, &"ws://example.com/chat".parse()?).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ClientUpgrader {
    config: Config,
    subprotocols: Vec<String>,
    compression: bool,
}

impl Default for ClientUpgrader {
    fn default() -> Self {
        Self::new(Config::client())
    }
}

impl ClientUpgrader {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            subprotocols: Vec::new(),
            compression: false,
        }
    }

    /// Subprotocols to request, most preferred first.
    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Offer permessage-deflate.
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Add the upgrade headers to `request` and return the challenge key
    /// needed to check the response.
    ///
    /// # Errors
    ///
    /// `Error::Io` if no random key can be generated.
    pub fn prepare_request<B>(&self, request: &mut Request<B>) -> Result<String> {
        let key = generate_challenge_key()?;
        let headers = request.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WS_VERSION));
        headers.insert(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&key).map_err(|_| Error::BadHandshake)?,
        );
        if !self.subprotocols.is_empty() {
            let value = HeaderValue::from_str(&self.subprotocols.join(", "))
                .map_err(|_| Error::BadHandshake)?;
            headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        if self.compression {
            headers.insert(
                SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static(NO_CONTEXT_TAKEOVER),
            );
        }
        Ok(key)
    }

    /// Check the server's answer to a request prepared with `key`.
    ///
    /// Any mismatch is reported as `Error::BadHandshake` without detail.
    ///
    /// # Errors
    ///
    /// `Error::BadHandshake`.
    pub fn check_response<B>(&self, key: &str, response: &Response<B>) -> Result<Negotiated> {
        let headers = response.headers();
        if response.status() != StatusCode::SWITCHING_PROTOCOLS
            || !has_token(headers, UPGRADE, "websocket")
            || !has_token(headers, CONNECTION, "upgrade")
        {
            return Err(Error::BadHandshake);
        }
        let accept = headers
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        if accept != Some(compute_accept_key(key).as_str()) {
            return Err(Error::BadHandshake);
        }

        let subprotocol = match headers.get(SEC_WEBSOCKET_PROTOCOL) {
            None => None,
            Some(value) => {
                let value = value.to_str().map_err(|_| Error::BadHandshake)?.trim();
                if !self.subprotocols.iter().any(|p| p == value) {
                    return Err(Error::BadHandshake);
                }
                Some(value.to_string())
            }
        };

        let extensions = ExtensionOffer::from_headers(headers);
        if extensions
            .iter()
            .any(|ext| !self.compression || !ext.is(PERMESSAGE_DEFLATE))
        {
            return Err(Error::BadHandshake);
        }

        Ok(Negotiated {
            subprotocol,
            compression: deflate::response_enables(&extensions),
        })
    }

    /// Check the response and take over the stream as a client connection.
    ///
    /// # Errors
    ///
    /// As for [`ClientUpgrader::check_response`].
    pub fn upgrade_response<B, T>(
        &self,
        key: &str,
        response: &Response<B>,
        hijacked: Hijacked<T>,
    ) -> Result<Connection<T>>
    where
        T: AsyncRead + AsyncWrite,
    {
        let negotiated = self.check_response(key, response)?;
        debug!(
            subprotocol = negotiated.subprotocol.as_deref().unwrap_or(""),
            compression = negotiated.compression,
            "websocket upgrade completed"
        );
        Ok(Connection::from_parts(
            hijacked.io,
            Role::Client,
            &self.config,
            negotiated,
            hijacked.read_buf,
        ))
    }

    /// Run the handshake on a raw stream for `uri`.
    ///
    /// Returns the connection and the server's response head.
    ///
    /// # Errors
    ///
    /// `Error::BadHandshake`, `Error::HandshakeTooLarge`, I/O errors and
    /// `Error::Timeout`.
    pub async fn connect<T>(&self, mut io: T, uri: &Uri) -> Result<(Connection<T>, Response<()>)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (key, response, read_buf) =
            with_timeout(self.config.handshake_timeout, self.exchange(&mut io, uri)).await?;
        let conn = self.upgrade_response(&key, &response, Hijacked::with_buffered(io, read_buf))?;
        Ok((conn, response))
    }

    async fn exchange<T>(&self, io: &mut T, uri: &Uri) -> Result<(String, Response<()>, BytesMut)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = Request::new(());
        *request.method_mut() = Method::GET;
        *request.uri_mut() = uri.clone();
        if let Some(authority) = uri.authority() {
            let host = HeaderValue::from_str(authority.as_str()).map_err(|_| Error::BadHandshake)?;
            request.headers_mut().insert(HOST, host);
        }
        let key = self.prepare_request(&mut request)?;

        let mut out = Vec::with_capacity(256);
        write_request_head(&request, &mut out);
        io.write_all(&out).await?;
        io.flush().await?;

        let mut buf = BytesMut::with_capacity(1024);
        let response = read_head(io, &mut buf, &self.config.limits, parse_response_head).await?;
        Ok((key, response, buf))
    }
}
