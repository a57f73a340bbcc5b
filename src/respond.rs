//! Error responses for failed CONNECT attempts.
//!
//! When the upstream dial fails, the client is still waiting for a response to
//! its CONNECT on a connection that may be reused afterwards. The response is
//! therefore always framed with an exact `Content-Length`, written in a single
//! write, and followed by an explicit decision whether the socket closes.

use std::fmt::Debug;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use n0_error::e;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};
use tracing::debug;

use crate::{
    dial::DialError,
    parse::{ConnectRequest, HttpResponse, encode_header},
    server::ConfigError,
};

/// Headers that determine message framing. Only the responder writes them.
static FRAMING_HEADERS: [header::HeaderName; 3] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

fn is_framing_header(name: &header::HeaderName) -> bool {
    FRAMING_HEADERS.contains(name)
}

/// Body sent with a CONNECT failure response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorBody {
    /// No body; the response carries `Content-Length: 0`.
    #[default]
    Empty,
    /// A fixed payload, sent verbatim.
    Fixed(Bytes),
    /// A short plain-text description of the dial failure.
    Diagnostic,
}

impl ErrorBody {
    /// Creates a fixed body from UTF-8 text or raw bytes.
    pub fn fixed(body: impl Into<Bytes>) -> Self {
        Self::Fixed(body.into())
    }

    fn render(&self, error: &DialError) -> Bytes {
        match self {
            ErrorBody::Empty => Bytes::new(),
            ErrorBody::Fixed(bytes) => bytes.clone(),
            ErrorBody::Diagnostic => Bytes::from(format!("{}: {error}", error.kind())),
        }
    }
}

/// Whether the socket is closed after an error response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SocketClose {
    /// Close only if `Connection: close` was sent.
    #[default]
    FollowHeader,
    /// Always close, even when no `Connection: close` header was sent.
    Always,
}

/// How a failed CONNECT is answered.
///
/// Immutable once built. The proxy keeps one policy and clones it into the
/// [`FailureContext`] of every failed attempt.
#[derive(Debug, Clone)]
pub struct ResponsePolicy {
    status: StatusCode,
    body: ErrorBody,
    send_connection_close: bool,
    close_socket: SocketClose,
    headers: HeaderMap<HeaderValue>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            body: ErrorBody::Empty,
            send_connection_close: true,
            close_socket: SocketClose::FollowHeader,
            headers: HeaderMap::new(),
        }
    }
}

impl ResponsePolicy {
    /// Creates a policy answering with `status`.
    ///
    /// Fails unless `status` is a 4xx or 5xx code.
    pub fn new(status: StatusCode) -> Result<Self, ConfigError> {
        if !(status.is_client_error() || status.is_server_error()) {
            return Err(e!(ConfigError::NotAnErrorStatus { status }));
        }
        Ok(Self {
            status,
            ..Default::default()
        })
    }

    /// Creates a policy from a numeric status code, as read from configuration.
    pub fn from_code(code: u16) -> Result<Self, ConfigError> {
        let status =
            StatusCode::from_u16(code).map_err(|source| e!(ConfigError::InvalidStatus { code, source }))?;
        Self::new(status)
    }

    /// Sets the response body.
    pub fn body(mut self, body: ErrorBody) -> Self {
        self.body = body;
        self
    }

    /// Sets whether `Connection: close` is sent.
    pub fn send_connection_close(mut self, send: bool) -> Self {
        self.send_connection_close = send;
        self
    }

    /// Sets whether the socket closes after the response regardless of the header.
    pub fn close_socket(mut self, close: SocketClose) -> Self {
        self.close_socket = close;
        self
    }

    /// Adds a header written before `Connection` and `Content-Length`.
    ///
    /// Framing headers (`Connection`, `Content-Length`, `Transfer-Encoding`) are
    /// ignored; the responder always computes them.
    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        if !is_framing_header(&name) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn error_body(&self) -> &ErrorBody {
        &self.body
    }

    pub fn sends_connection_close(&self) -> bool {
        self.send_connection_close
    }
}

/// Everything known about one failed CONNECT attempt.
#[derive(derive_more::Debug)]
pub struct FailureContext {
    /// Why the tunnel could not be established.
    pub error: DialError,
    /// The request that triggered the attempt.
    pub request: ConnectRequest,
    /// How to answer it.
    pub policy: ResponsePolicy,
    #[debug("{:?}", completion.as_ref().map(|_| "oneshot::Sender"))]
    completion: Option<oneshot::Sender<ResponseOutcome>>,
}

impl FailureContext {
    pub fn new(error: DialError, request: ConnectRequest, policy: ResponsePolicy) -> Self {
        Self {
            error,
            request,
            policy,
            completion: None,
        }
    }

    /// Attaches a handle that receives the outcome once the response is written.
    pub fn with_completion(mut self, completion: oneshot::Sender<ResponseOutcome>) -> Self {
        self.completion = Some(completion);
        self
    }
}

/// What happens to the client connection after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDisposition {
    /// The connection must be closed.
    Close,
    /// Exactly one framed response was written; the next request may follow.
    Reusable,
}

/// Result of [`respond`], consumed by the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Response written; keep reading requests on this connection.
    Reusable,
    /// Response written; close the connection.
    Closed,
    /// Writing the response failed. The connection is unusable.
    WriteFailed,
}

/// A fully encoded response and the connection disposition that goes with it.
#[derive(Debug, Clone)]
pub struct RenderedResponse {
    bytes: Bytes,
    head_len: usize,
    disposition: ConnectionDisposition,
}

impl RenderedResponse {
    /// Encodes `head` followed by `body` into one contiguous buffer.
    ///
    /// Any `Connection`, `Content-Length` or `Transfer-Encoding` headers in `head`
    /// are dropped. `Connection: close` is only added when `connection_close` is
    /// set and the status is not `200 OK`. `Content-Length` is always the last
    /// header and always equals `body.len()`.
    pub fn new(
        head: &HttpResponse,
        body: &[u8],
        connection_close: bool,
        close_socket: SocketClose,
    ) -> Self {
        let connection_close = connection_close && head.status != StatusCode::OK;
        let mut head = head.clone();
        for name in &FRAMING_HEADERS {
            head.headers.remove(name);
        }
        let mut buf = BytesMut::with_capacity(256 + body.len());
        head.encode_head(&mut buf);
        if connection_close {
            encode_header(&mut buf, "Connection", b"close");
        }
        encode_header(&mut buf, "Content-Length", body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        let head_len = buf.len();
        buf.extend_from_slice(body);
        let disposition = if connection_close || close_socket == SocketClose::Always {
            ConnectionDisposition::Close
        } else {
            ConnectionDisposition::Reusable
        };
        Self {
            bytes: buf.freeze(),
            head_len,
            disposition,
        }
    }

    /// The complete response as written to the socket.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The status line and header section, including the blank line.
    pub fn head(&self) -> &[u8] {
        &self.bytes[..self.head_len]
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[self.head_len..]
    }

    pub fn disposition(&self) -> ConnectionDisposition {
        self.disposition
    }
}

/// Renders the response for a failed CONNECT.
///
/// Set a custom responder with
/// [`ProxyOpts::failure_responder`](crate::ProxyOpts::failure_responder).
pub trait FailureResponder: Send + Sync + Debug {
    fn render(&self, context: &FailureContext) -> RenderedResponse;
}

/// Renders the [`ResponsePolicy`] carried in the failure context.
#[derive(Debug, Default, Clone)]
pub struct PolicyResponder;

impl FailureResponder for PolicyResponder {
    fn render(&self, context: &FailureContext) -> RenderedResponse {
        let policy = &context.policy;
        let mut head = HttpResponse::new(policy.status);
        head.headers = policy.headers.clone();
        let body = policy.body.render(&context.error);
        RenderedResponse::new(
            &head,
            &body,
            policy.send_connection_close,
            policy.close_socket,
        )
    }
}

/// Writes the failure response for `context` to the client.
///
/// The response is written with a single `write_all` and flushed. Closing the
/// socket is left to the caller, guided by the returned outcome. Write errors
/// are logged and reported as [`ResponseOutcome::WriteFailed`]; they are not
/// retried and no fallback response is attempted.
pub async fn respond(
    writer: &mut (impl AsyncWrite + Unpin),
    mut context: FailureContext,
    responder: &dyn FailureResponder,
) -> ResponseOutcome {
    let rendered = responder.render(&context);
    let outcome = match write_rendered(writer, &rendered).await {
        Ok(()) => {
            debug!(
                status = %context.policy.status,
                content_length = rendered.body().len(),
                disposition = ?rendered.disposition(),
                "CONNECT failure response sent"
            );
            match rendered.disposition() {
                ConnectionDisposition::Close => ResponseOutcome::Closed,
                ConnectionDisposition::Reusable => ResponseOutcome::Reusable,
            }
        }
        Err(err) => {
            debug!("could not send CONNECT failure response: {err:#}");
            ResponseOutcome::WriteFailed
        }
    };
    if let Some(completion) = context.completion.take() {
        completion.send(outcome).ok();
    }
    outcome
}

async fn write_rendered(
    writer: &mut (impl AsyncWrite + Unpin),
    rendered: &RenderedResponse,
) -> std::io::Result<()> {
    writer.write_all(rendered.as_bytes()).await?;
    writer.flush().await
}
