use std::{sync::Arc, time::Duration};

use http::StatusCode;
use n0_error::{Result, StdResultExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    dial::{Dialer, DynDialer, TcpDialer},
    parse::{ConnectRequest, HttpResponse},
    respond::{FailureContext, ResponsePolicy},
    util::{Prebuffered, forward_bidi},
};

/// Outcome of one CONNECT negotiation.
#[derive(Debug)]
pub enum Negotiation {
    /// The upstream connection is open; the client may be switched to relay mode.
    Established(TcpStream),
    /// The dial failed; the context is handed to the failure responder.
    Failed(Box<FailureContext>),
}

/// Opens upstream connections for CONNECT requests.
///
/// Each request is a single dial attempt bounded by the connect timeout. Retries,
/// if any, are up to the client.
#[derive(derive_more::Debug, Clone)]
pub struct TunnelNegotiator {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
    connect_timeout: Duration,
}

impl TunnelNegotiator {
    pub fn new(dialer: impl Dialer + 'static, connect_timeout: Duration) -> Self {
        Self {
            dialer: DynDialer::new_arc(dialer),
            connect_timeout,
        }
    }

    pub(crate) fn from_parts(dialer: Arc<DynDialer<'static>>, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dials the target of `request`.
    ///
    /// Never writes to the client. On failure, `policy` is cloned into the returned
    /// [`FailureContext`].
    pub async fn negotiate(&self, request: ConnectRequest, policy: &ResponsePolicy) -> Negotiation {
        let authority = &request.authority;
        match self.dialer.dial(authority, self.connect_timeout).await {
            Ok(stream) => {
                debug!(%authority, "connected to upstream");
                Negotiation::Established(stream)
            }
            Err(error) => {
                debug!(%authority, kind = %error.kind(), "failed to connect to upstream: {error:#}");
                Negotiation::Failed(Box::new(FailureContext::new(
                    error,
                    request,
                    policy.clone(),
                )))
            }
        }
    }
}

impl Default for TunnelNegotiator {
    fn default() -> Self {
        Self::new(TcpDialer, crate::server::DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Confirms the tunnel to the client and relays bytes until either side closes.
///
/// Bytes the client sent after the CONNECT header section are still buffered in
/// `client_recv` and reach the upstream first.
pub(crate) async fn relay(
    client_recv: &mut Prebuffered<impl AsyncRead + Send + Unpin>,
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream: TcpStream,
) -> Result<(u64, u64)> {
    HttpResponse::with_reason(StatusCode::OK, "Connection Established")
        .write(client_send)
        .await
        .std_context("Failed to write CONNECT response to client")?;
    let (mut upstream_recv, mut upstream_send) = upstream.into_split();
    forward_bidi(client_recv, client_send, &mut upstream_recv, &mut upstream_send).await
}
