use std::{future::Future, io, time::Duration};

use dynosaur::dynosaur;
use n0_error::{e, stack_error};
use tokio::net::TcpStream;
use tracing::trace;

use crate::parse::Authority;

/// Broad classification of a failed dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DialErrorKind {
    /// The host name did not resolve to any address.
    #[display("dns failure")]
    DnsFailure,
    /// Every resolved address refused the connection.
    #[display("connection refused")]
    ConnectionRefused,
    /// The dial did not complete within the connect timeout.
    #[display("timeout")]
    Timeout,
    /// Any other I/O error before the tunnel became usable.
    #[display("connect error")]
    Other,
}

/// Failure to open a TCP connection to a CONNECT target.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    #[error("failed to resolve {authority}")]
    DnsFailure {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("connection to {authority} refused")]
    ConnectionRefused {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("timed out connecting to {authority} after {timeout:?}")]
    Timeout {
        authority: Authority,
        timeout: Duration,
    },
    /// The operating system gave up on the connect before our own timeout did.
    #[error("connection to {authority} timed out")]
    ConnectTimedOut {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("failed to connect to {authority}")]
    Other {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl DialError {
    pub fn kind(&self) -> DialErrorKind {
        match self {
            DialError::DnsFailure { .. } => DialErrorKind::DnsFailure,
            DialError::ConnectionRefused { .. } => DialErrorKind::ConnectionRefused,
            DialError::Timeout { .. } | DialError::ConnectTimedOut { .. } => DialErrorKind::Timeout,
            DialError::Other { .. } => DialErrorKind::Other,
        }
    }

    /// Classifies an I/O error returned by a connect attempt.
    #[track_caller]
    pub fn from_connect_error(authority: Authority, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => {
                e!(DialError::ConnectionRefused { authority, source })
            }
            io::ErrorKind::TimedOut => e!(DialError::ConnectTimedOut { authority, source }),
            _ => e!(DialError::Other { authority, source }),
        }
    }
}

#[dynosaur(pub(crate) DynDialer = dyn(box) Dialer)]
/// Opens TCP connections to CONNECT targets.
///
/// The default implementation is [`TcpDialer`]. Implement this trait to route
/// dials through something else, e.g. a test double or a socket factory with
/// custom socket options.
pub trait Dialer: Send + Sync {
    /// Connects to `authority`, giving up after `timeout`.
    fn dial<'a>(
        &'a self,
        authority: &'a Authority,
        timeout: Duration,
    ) -> impl Future<Output = Result<TcpStream, DialError>> + Send + 'a;
}

/// Dials with tokio's resolver and [`TcpStream::connect`].
///
/// Resolution and connect share one timeout. Resolved addresses are tried in
/// order; the error of the last one is reported.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial<'a>(
        &'a self,
        authority: &'a Authority,
        timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        match tokio::time::timeout(timeout, dial_inner(authority)).await {
            Ok(res) => res,
            Err(_elapsed) => Err(e!(DialError::Timeout {
                authority: authority.clone(),
                timeout
            })),
        }
    }
}

async fn dial_inner(authority: &Authority) -> Result<TcpStream, DialError> {
    let addrs = tokio::net::lookup_host(authority.to_addr())
        .await
        .map_err(|source| {
            e!(DialError::DnsFailure {
                authority: authority.clone(),
                source
            })
        })?;
    let mut last_err = None;
    for addr in addrs {
        trace!(%addr, "connecting");
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    let source = last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
    });
    if source.kind() == io::ErrorKind::NotFound {
        return Err(e!(DialError::DnsFailure {
            authority: authority.clone(),
            source
        }));
    }
    Err(DialError::from_connect_error(authority.clone(), source))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn closed_port() -> Authority {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Authority::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn dial_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let authority = Authority::new("127.0.0.1", addr.port());
        let stream = TcpDialer
            .dial(&authority, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn dial_closed_port_is_refused() {
        let authority = closed_port().await;
        let err = TcpDialer
            .dial(&authority, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DialErrorKind::ConnectionRefused);
        assert!(err.to_string().contains(&authority.to_string()));
    }

    #[tokio::test]
    async fn dial_unresolvable_host() {
        let authority = Authority::new("not-a-valid-host.invalid", 443);
        let err = TcpDialer
            .dial(&authority, Duration::from_secs(5))
            .await
            .unwrap_err();
        // Sandboxed resolvers may stall instead of failing fast.
        assert!(
            matches!(err.kind(), DialErrorKind::DnsFailure | DialErrorKind::Timeout),
            "unexpected kind {}",
            err.kind()
        );
    }

    #[test]
    fn classify_connect_errors() {
        let authority = Authority::new("example.com", 443);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let err = DialError::from_connect_error(authority.clone(), refused);
        assert_eq!(err.kind(), DialErrorKind::ConnectionRefused);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "no route to peer");
        let err = DialError::from_connect_error(authority.clone(), timed_out);
        assert_eq!(err.kind(), DialErrorKind::Timeout);
        assert!(err.to_string().starts_with("connection to example.com:443 timed out"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "no route to peer");

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let err = DialError::from_connect_error(authority, reset);
        assert_eq!(err.kind(), DialErrorKind::Other);
    }
}
