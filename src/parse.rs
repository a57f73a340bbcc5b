use std::str::FromStr;

use bytes::BytesMut;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version, uri::Uri};
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr, e, ensure_any, stack_error};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Host and port authority parsed from a CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Creates an authority from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an authority-form URI with no scheme and no path.
    ///
    /// Note: the URI must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self::new(authority.host(), port))
    }

    /// Parses an authority-form request target from a string.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }

    /// Returns the `host:port` string handed to the resolver.
    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Formats a minimal CONNECT request for this authority.
    pub fn to_connect_request(&self) -> String {
        format!("CONNECT {self} HTTP/1.1\r\nHost: {self}\r\n\r\n")
    }
}

/// Errors while reading a request header section from a client.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ReadError {
    /// The peer closed the connection before a full header section arrived.
    #[error("connection closed before end of header section")]
    Eof,
    /// The header section did not fit into the read buffer.
    #[error("header section exceeds {limit} bytes")]
    TooLarge { limit: usize },
    /// The header section is not a valid HTTP request.
    #[error("invalid request")]
    Invalid {
        #[error(source)]
        source: AnyError,
    },
    /// Reading from the client failed.
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Request line and header section of an inbound HTTP/1.x request.
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw request target as sent by the client.
    pub target: String,
    /// Protocol version from the request line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpRequest {
    /// Reads and parses the request line and header section.
    ///
    /// Removes the header section from `reader`; bytes after it stay buffered.
    /// Returns `Ok(None)` if the peer closed the connection before sending anything,
    /// which is the normal end of a keep-alive connection.
    pub async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Option<Self>, ReadError> {
        loop {
            match Self::parse_with_len(reader.buffer()) {
                Err(source) => return Err(e!(ReadError::Invalid { source })),
                Ok(Some((len, request))) => {
                    reader.discard(len);
                    return Ok(Some(request));
                }
                Ok(None) => {}
            }
            if reader.is_full() {
                return Err(e!(ReadError::TooLarge {
                    limit: reader.max_len()
                }));
            }
            let n = reader
                .buffer_more()
                .await
                .map_err(|source| e!(ReadError::Io { source }))?;
            if n == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(e!(ReadError::Eof));
            }
        }
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, req)| req))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req.method.context("Missing HTTP method")?;
                let method = Method::from_str(method).std_context("Invalid HTTP method")?;
                let target = req.path.context("Missing request target")?.to_string();
                let version = match req.version.context("Missing HTTP version")? {
                    0 => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let headers = collect_headers(req.headers);
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        version,
                        headers,
                    },
                )))
            }
        }
    }

    /// Returns true if the client asked for the connection to close after this exchange.
    pub fn wants_close(&self) -> bool {
        let connection_close = self
            .headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"));
        connection_close || self.version == Version::HTTP_10
    }

    /// Converts to a [`ConnectRequest`].
    ///
    /// Note: any method other than CONNECT, or a target that is not authority-form, is an error.
    pub fn try_into_connect(self) -> Result<ConnectRequest> {
        if self.method != Method::CONNECT {
            return Err(anyerr!("Expected CONNECT request, got {}", self.method));
        }
        let authority = Authority::from_authority_str(&self.target)?;
        Ok(ConnectRequest {
            authority,
            version: self.version,
            headers: self.headers,
        })
    }
}

/// A parsed CONNECT request.
///
/// Owned by the connection task for the duration of one negotiation attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Target the client wants a tunnel to.
    pub authority: Authority,
    /// Protocol version from the request line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl ConnectRequest {
    /// Creates a request for `authority` with no headers.
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// Parsed HTTP response with status, reason, and headers.
#[derive(derive_more::Debug, Clone)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_reason(status: StatusCode, reason: impl ToString) -> Self {
        Self {
            status,
            reason: Some(reason.to_string()),
            headers: HeaderMap::new(),
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.1 response, including the trailing CRLF.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Appends the status line and headers to `buf`, without the terminating blank line.
    pub(crate) fn encode_head(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.status_line().as_bytes());
        for (key, value) in self.headers.iter() {
            encode_header(buf, key.as_str(), value.as_bytes());
        }
    }

    /// Writes the status line, headers and the terminating blank line.
    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let mut buf = BytesMut::new();
        self.encode_head(&mut buf);
        buf.extend_from_slice(b"\r\n");
        writer.write_all(&buf).await?;
        writer.flush().await
    }

    /// Returns the value of the `Content-Length` header, if present and valid.
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, res)| res))
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = collect_headers(res.headers);
                Ok(Some((
                    header_len,
                    HttpResponse {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Removes the header section from `reader`; the body stays buffered.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
            if reader.is_full() {
                return Err(anyerr!(
                    "Buffer size limit reached before end of response header section"
                ));
            }
            if reader.buffer_more().await? == 0 {
                return Err(anyerr!("Connection closed before end of response header section"));
            }
        }
    }
}

pub(crate) fn encode_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> HeaderMap<HeaderValue> {
    HeaderMap::from_iter(headers.iter().flat_map(|h| {
        let value = HeaderValue::from_bytes(h.value).ok()?;
        let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        Some((name, value))
    }))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parse_connect_request() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01";
        let (len, req) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(&buf[len..], b"\x16\x03\x01");
        assert_eq!(req.method, Method::CONNECT);
        assert!(!req.wants_close());
        let connect = req.try_into_connect().unwrap();
        assert_eq!(connect.authority, Authority::new("example.com", 443));
        assert_eq!(connect.version, Version::HTTP_11);
        assert_eq!(connect.headers.get("host").unwrap(), "example.com:443");
    }

    #[test]
    fn parse_partial_request() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: exa";
        assert!(HttpRequest::parse(buf).unwrap().is_none());
    }

    #[test]
    fn connect_requires_authority_form() {
        for target in ["http://example.com:443/", "example.com", "/path"] {
            let buf = format!("CONNECT {target} HTTP/1.1\r\n\r\n");
            let req = HttpRequest::parse(buf.as_bytes()).unwrap().unwrap();
            assert!(req.try_into_connect().is_err(), "{target} should be rejected");
        }
    }

    #[test]
    fn non_connect_method_is_rejected() {
        let req = HttpRequest::parse(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, Method::GET);
        assert!(req.try_into_connect().is_err());
    }

    #[test]
    fn ipv6_authority_keeps_brackets() {
        let authority = Authority::from_authority_str("[::1]:8443").unwrap();
        assert_eq!(authority.host, "[::1]");
        assert_eq!(authority.port, 8443);
        assert_eq!(authority.to_addr(), "[::1]:8443");
    }

    #[test]
    fn wants_close_from_header_and_version() {
        let req = HttpRequest::parse(b"CONNECT a:1 HTTP/1.1\r\nConnection: keep-alive, close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.wants_close());
        let req = HttpRequest::parse(b"CONNECT a:1 HTTP/1.0\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.wants_close());
    }

    #[test]
    fn response_status_line_uses_canonical_reason() {
        let res = HttpResponse::new(StatusCode::BAD_GATEWAY);
        assert_eq!(res.status_line(), "HTTP/1.1 502 Bad Gateway\r\n");
        let res = HttpResponse::with_reason(StatusCode::OK, "Connection Established");
        assert_eq!(res.status_line(), "HTTP/1.1 200 Connection Established\r\n");
    }

    #[tokio::test]
    async fn read_keeps_pipelined_bytes() {
        let data = b"CONNECT a:1 HTTP/1.1\r\n\r\nCONNECT b:2 HTTP/1.1\r\n\r\n";
        let mut reader = Prebuffered::new(Cursor::new(&data[..]), 1024);
        let first = HttpRequest::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.target, "a:1");
        let second = HttpRequest::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.target, "b:2");
        assert!(HttpRequest::read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_reports_truncated_and_oversized_heads() {
        let mut reader = Prebuffered::new(Cursor::new(&b"CONNECT a:1 HTTP/1.1\r\nHo"[..]), 1024);
        let err = HttpRequest::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, ReadError::Eof { .. }));

        let long = format!("CONNECT a:1 HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "x".repeat(200));
        let mut reader = Prebuffered::new(Cursor::new(long.into_bytes()), 64);
        let err = HttpRequest::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, ReadError::TooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn read_response_leaves_body_buffered() {
        let data = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 4\r\n\r\ntest";
        let mut reader = Prebuffered::new(Cursor::new(&data[..]), 1024);
        let res = HttpResponse::read(&mut reader).await.unwrap();
        assert_eq!(res.status, StatusCode::BAD_GATEWAY);
        assert_eq!(res.reason(), "Bad Gateway");
        assert_eq!(res.content_length(), Some(4));
        assert_eq!(reader.buffer(), b"test");
    }
}
