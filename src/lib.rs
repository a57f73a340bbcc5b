//! HTTP CONNECT proxy building blocks.
//!
//! [`ConnectProxy`] accepts client connections and negotiates a TCP tunnel for each
//! CONNECT request through a [`TunnelNegotiator`]. When the upstream can't be
//! reached, [`respond`] writes a well-framed error response as configured by a
//! [`ResponsePolicy`] and tells the connection loop whether the client
//! connection can be reused.

mod dial;
mod parse;
mod respond;
mod server;
mod tunnel;
mod util;


/// Maximum size of a request header section buffered before the request is rejected.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

pub use {
    dial::{DialError, DialErrorKind, Dialer, TcpDialer},
    parse::{Authority, ConnectRequest, HttpRequest, HttpResponse, ReadError},
    respond::{
        ConnectionDisposition, ErrorBody, FailureContext, FailureResponder, PolicyResponder,
        RenderedResponse, ResponseOutcome, ResponsePolicy, SocketClose, respond,
    },
    server::{ConfigError, ConnectProxy, DEFAULT_CONNECT_TIMEOUT, ProxyOpts},
    tunnel::{Negotiation, TunnelNegotiator},
    util::Prebuffered,
};
