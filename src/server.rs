use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use http::{HeaderValue, Method, StatusCode, header};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::{
    io::{AsyncWriteExt, sink},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

pub use self::opts::{ConfigError, DEFAULT_CONNECT_TIMEOUT, ProxyOpts};
use crate::{
    parse::{HttpRequest, HttpResponse, ReadError},
    respond::{RenderedResponse, ResponseOutcome, SocketClose, respond},
    tunnel::{Negotiation, TunnelNegotiator, relay},
    util::Prebuffered,
};

mod opts;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long unread client bytes are drained after our side of a closing
/// connection has been shut down.
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

type ClientRecv = Prebuffered<OwnedReadHalf>;

/// HTTP CONNECT proxy.
///
/// Accepts TCP connections, reads CONNECT requests and either tunnels each one to
/// its target or answers with the configured failure response. A connection whose
/// failure response allows reuse is kept open for the next request.
///
/// ```ignore
/// let listener = TcpListener::bind("127.0.0.1:8080").await?;
/// let proxy = ConnectProxy::new(ProxyOpts::default())?;
/// proxy.serve(listener).await?;
/// ```
#[derive(derive_more::Debug, Clone)]
pub struct ConnectProxy {
    opts: Arc<ProxyOpts>,
    negotiator: TunnelNegotiator,
    conn_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectProxy {
    /// Creates a proxy after validating `opts`.
    pub fn new(opts: ProxyOpts) -> Result<Self, ConfigError> {
        opts.validate()?;
        Ok(Self {
            negotiator: opts.negotiator(),
            opts: Arc::new(opts),
            conn_id: Default::default(),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn opts(&self) -> &ProxyOpts {
        &self.opts
    }

    /// Accepts connections from `listener` and handles each in a new task.
    ///
    /// Returns once [`Self::shutdown`] is called, or with an error if the listener
    /// fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, client_addr) = match listener
                .accept()
                .with_cancellation_token(&self.shutdown)
                .await
            {
                None => return Ok(()),
                Some(Ok(conn)) => conn,
                Some(Err(err)) if is_transient_accept_error(&err) => {
                    debug!("failed to accept connection: {err:#}");
                    continue;
                }
                Some(Err(err)) => return Err(err).std_context("failed to accept TCP connection"),
            };
            let id = self.conn_id.fetch_add(1, Ordering::SeqCst);
            let this = self.clone();
            self.tasks.spawn(
                self.abort
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!("accepted TCP connection");
                        if let Err(err) = this.handle_connection(stream).await {
                            if this.shutdown.is_cancelled() {
                                debug!("aborted at shutdown: {err:#}");
                            } else {
                                warn!("failed to handle connection: {err:#}");
                            }
                        }
                    })
                    .instrument(error_span!("conn", id, %client_addr)),
            );
        }
    }

    /// Stops accepting connections and waits briefly for open ones to finish.
    ///
    /// Idle keep-alive connections are closed right away. Tunnels still open
    /// after the grace period are aborted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending connections)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => {
                debug!(
                    remaining = self.tasks.len(),
                    "not all connections closed in time, abort"
                );
                self.abort.cancel();
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (recv, mut send) = stream.into_split();
        let mut recv = Prebuffered::new(recv, self.opts.max_header_len());
        loop {
            let request = match HttpRequest::read(&mut recv)
                .with_cancellation_token(&self.shutdown)
                .await
            {
                None => {
                    debug!("closing connection at shutdown");
                    return Ok(());
                }
                Some(Ok(Some(request))) => request,
                Some(Ok(None)) => {
                    debug!("client closed connection");
                    return Ok(());
                }
                Some(Err(err)) => return reject_unreadable(&mut recv, &mut send, err).await,
            };
            debug!(method = %request.method, target = %request.target, "received request");

            let wants_close = request.wants_close();
            if request.method != Method::CONNECT {
                let mut head = HttpResponse::new(StatusCode::METHOD_NOT_ALLOWED);
                head.headers
                    .insert(header::ALLOW, HeaderValue::from_static("CONNECT"));
                return reject(&mut recv, &mut send, head).await;
            }
            let request = match request.try_into_connect() {
                Ok(request) => request,
                Err(err) => {
                    debug!("invalid CONNECT request: {err:#}");
                    return reject(&mut recv, &mut send, HttpResponse::new(StatusCode::BAD_REQUEST))
                        .await;
                }
            };

            let negotiation = tokio::select! {
                negotiation = self.negotiator.negotiate(request, self.opts.policy()) => negotiation,
                _ = recv.disconnected() => {
                    debug!("client disconnected while connecting to upstream");
                    return Ok(());
                }
            };

            match negotiation {
                Negotiation::Established(upstream) => {
                    let (to_upstream, to_client) = relay(&mut recv, &mut send, upstream).await?;
                    debug!(to_upstream, to_client, "tunnel closed");
                    return Ok(());
                }
                Negotiation::Failed(context) => {
                    match respond(&mut send, *context, self.opts.responder()).await {
                        ResponseOutcome::Reusable if !wants_close => {
                            debug!("keeping connection open for next request");
                        }
                        ResponseOutcome::Reusable | ResponseOutcome::Closed => {
                            close(&mut recv, &mut send).await;
                            return Ok(());
                        }
                        ResponseOutcome::WriteFailed => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Answers a request whose header section could not be read, if the client can
/// still receive a response.
async fn reject_unreadable(
    recv: &mut ClientRecv,
    send: &mut OwnedWriteHalf,
    err: ReadError,
) -> Result<()> {
    match err {
        ReadError::TooLarge { limit, .. } => {
            debug!(limit, "request header section too large");
            let head = HttpResponse::new(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
            reject(recv, send, head).await
        }
        ReadError::Invalid { .. } => {
            debug!("malformed request: {err:#}");
            reject(recv, send, HttpResponse::new(StatusCode::BAD_REQUEST)).await
        }
        ReadError::Eof { .. } => {
            debug!("client closed connection mid-request");
            Ok(())
        }
        err => Err(err).context("failed to read request"),
    }
}

/// Writes a bodyless error response with `Connection: close` and closes the connection.
async fn reject(recv: &mut ClientRecv, send: &mut OwnedWriteHalf, head: HttpResponse) -> Result<()> {
    let rendered = RenderedResponse::new(&head, b"", true, SocketClose::Always);
    send.write_all(rendered.as_bytes())
        .await
        .std_context("failed to write error response")?;
    send.flush()
        .await
        .std_context("failed to write error response")?;
    debug!(status = %head.status, "rejected request");
    close(recv, send).await;
    Ok(())
}

/// Shuts down our sending side, then discards whatever the client still sends
/// until it closes too.
///
/// Closing a socket with unread data makes the kernel reset the connection, which
/// can destroy a response the client has not read yet.
async fn close(recv: &mut ClientRecv, send: &mut OwnedWriteHalf) {
    send.shutdown().await.ok();
    let drained = tokio::io::copy(recv, &mut sink())
        .timeout(LINGER_TIMEOUT)
        .await;
    debug!(?drained, "connection closed");
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
