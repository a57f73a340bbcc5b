use std::{sync::Arc, time::Duration};

use n0_error::{e, stack_error};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    dial::{Dialer, DynDialer, TcpDialer},
    respond::{FailureResponder, PolicyResponder, ResponsePolicy},
    tunnel::TunnelNegotiator,
};

/// Maximum time to wait for an upstream connection, unless configured otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Invalid proxy configuration.
///
/// Returned when options are built or validated, never per request.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid status code {code}")]
    InvalidStatus {
        code: u16,
        #[error(source, std_err)]
        source: http::status::InvalidStatusCode,
    },
    #[error("status {status} is not a client or server error")]
    NotAnErrorStatus { status: http::StatusCode },
    #[error("connect timeout must be non-zero")]
    ZeroConnectTimeout,
    #[error("header section limit must be non-zero")]
    ZeroHeaderSectionLimit,
}

/// Configuration for [`ConnectProxy`](crate::ConnectProxy).
///
/// ```ignore
/// let policy = ResponsePolicy::from_code(502)?
///     .body(ErrorBody::fixed("upstream unreachable"))
///     .send_connection_close(false);
/// let opts = ProxyOpts::default()
///     .connect_timeout(Duration::from_secs(5))
///     .response_policy(policy);
/// ```
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOpts {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
    connect_timeout: Duration,
    policy: ResponsePolicy,
    responder: Arc<dyn FailureResponder>,
    header_section_max_length: usize,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self {
            dialer: DynDialer::new_arc(TcpDialer),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            policy: ResponsePolicy::default(),
            responder: Arc::new(PolicyResponder),
            header_section_max_length: HEADER_SECTION_MAX_LENGTH,
        }
    }
}

impl ProxyOpts {
    /// Sets the dialer used to reach CONNECT targets.
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = DynDialer::new_arc(dialer);
        self
    }

    /// Sets the upstream connect timeout, covering both resolution and connect.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how failed CONNECT attempts are answered.
    pub fn response_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the default [`PolicyResponder`].
    ///
    /// The responder still receives the configured [`ResponsePolicy`] in each
    /// failure context and may ignore it.
    pub fn failure_responder(mut self, responder: impl FailureResponder + 'static) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Sets how many bytes of request header section are buffered before giving up.
    pub fn header_section_max_length(mut self, len: usize) -> Self {
        self.header_section_max_length = len;
        self
    }

    pub fn policy(&self) -> &ResponsePolicy {
        &self.policy
    }

    /// Checks the options for values that would fail every request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(e!(ConfigError::ZeroConnectTimeout));
        }
        if self.header_section_max_length == 0 {
            return Err(e!(ConfigError::ZeroHeaderSectionLimit));
        }
        Ok(())
    }

    pub(crate) fn negotiator(&self) -> TunnelNegotiator {
        TunnelNegotiator::from_parts(self.dialer.clone(), self.connect_timeout)
    }

    pub(crate) fn responder(&self) -> &dyn FailureResponder {
        self.responder.as_ref()
    }

    pub(crate) fn max_header_len(&self) -> usize {
        self.header_section_max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opts_are_valid() {
        let opts = ProxyOpts::default();
        opts.validate().unwrap();
        assert_eq!(opts.policy().status(), http::StatusCode::BAD_GATEWAY);
        assert!(opts.policy().sends_connection_close());
        assert_eq!(opts.negotiator().connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn zero_values_fail_fast() {
        let err = ProxyOpts::default()
            .connect_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConnectTimeout { .. }));

        let err = ProxyOpts::default()
            .header_section_max_length(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroHeaderSectionLimit { .. }));
    }
}
