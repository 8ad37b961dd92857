//! Classified fetch failures and the errors surfaced by cached resources

use std::{error, fmt, sync::Arc, time::Duration};

/// The class of a fetch failure
///
/// The class decides whether a failure is retried and whether a
/// last-known-good value may be served in its place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The authority asked us to back off (`429`) or is down for maintenance (`503`)
    TemporarilyUnavailable,
    /// The authority rejected the request itself
    Client,
    /// The request never produced a response (connection, DNS, timeout)
    Transport,
    /// The authority responded, but the response could not be understood
    Malformed,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth another attempt
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TemporarilyUnavailable | Self::Transport)
    }

    /// Whether a failure of this kind may be masked by an outage value
    #[inline]
    pub fn is_outage_cacheable(self) -> bool {
        matches!(self, Self::TemporarilyUnavailable | Self::Transport)
    }

    /// Classifies a non-success HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 503 => Self::TemporarilyUnavailable,
            _ => Self::Client,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::TemporarilyUnavailable => "authority temporarily unavailable",
            Self::Client => "request rejected by authority",
            Self::Transport => "transport failure",
            Self::Malformed => "malformed response",
        })
    }
}

/// A failure to fetch a resource from its authority
#[derive(Clone, Debug)]
pub struct FetchError {
    kind: ErrorKind,
    status: Option<u16>,
    detail: String,
    retry_after: Option<Duration>,
    source: Option<Arc<dyn error::Error + Send + Sync + 'static>>,
}

impl FetchError {
    /// Constructs a new error of the given kind
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            detail: detail.into(),
            retry_after: None,
            source: None,
        }
    }

    /// Constructs an error from an unsuccessful HTTP status and its response body
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorKind::from_status(status), body)
        }
    }

    /// Constructs a transport error
    pub fn transport<E>(source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorKind::Transport, "request failed").with_source(source)
    }

    /// Constructs an error for a response that could not be understood
    pub fn malformed<E>(source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorKind::Malformed, "unable to parse response").with_source(source)
    }

    /// Constructs the error reported when a fetch exceeds its time allowance
    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(
            ErrorKind::Transport,
            format!("no response within {} ms", elapsed.as_millis()),
        )
    }

    /// Attaches an underlying cause
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Attaches the delay the authority asked for before trying again
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attaches the delay from a `Retry-After` header value
    ///
    /// Only the delay-seconds form is understood; dates are ignored.
    pub fn with_retry_after_header(self, value: Option<&str>) -> Self {
        match value.and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(secs) => self.with_retry_after(Duration::from_secs(secs)),
            None => self,
        }
    }

    /// The class of this failure
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status returned by the authority, if any
    #[inline]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The minimum delay the authority asked for before trying again
    #[inline]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Whether this failure is worth another attempt
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether this failure may be masked by an outage value
    #[inline]
    pub fn is_outage_cacheable(&self) -> bool {
        self.kind.is_outage_cacheable()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {}): {}", self.kind, status, self.detail),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

impl error::Error for FetchError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn error::Error + 'static))
    }
}

/// An error produced when a cached resource cannot produce any value
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResourceError {
    /// The authority could not be reached and no usable value was cached
    #[error("resource unavailable")]
    Unavailable(#[source] FetchError),
    /// A refresh was denied by the rate limiter and no usable value was cached
    #[error("refresh denied by rate limiter and no usable value is cached")]
    RateLimited,
}

impl ResourceError {
    /// The underlying fetch failure, if there was one
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Unavailable(err) => Some(err),
            Self::RateLimited => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_statuses_are_temporary() {
        assert_eq!(
            FetchError::from_status(429, "").kind(),
            ErrorKind::TemporarilyUnavailable
        );
        assert_eq!(
            FetchError::from_status(503, "").kind(),
            ErrorKind::TemporarilyUnavailable
        );
    }

    #[test]
    fn other_statuses_are_client_errors() {
        for status in [400, 401, 403, 404, 500, 502] {
            let err = FetchError::from_status(status, "nope");
            assert_eq!(err.kind(), ErrorKind::Client);
            assert!(!err.is_retryable());
            assert!(!err.is_outage_cacheable());
        }
    }

    #[test]
    fn transport_errors_keep_their_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = FetchError::transport(io);
        assert!(err.is_retryable());
        assert!(error::Error::source(&err).is_some());
    }

    #[test]
    fn retry_after_accepts_delay_seconds_only() {
        let err = FetchError::from_status(429, "").with_retry_after_header(Some(" 7 "));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = FetchError::from_status(503, "")
            .with_retry_after_header(Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn display_includes_status() {
        let err = FetchError::from_status(503, "maintenance");
        assert_eq!(
            err.to_string(),
            "authority temporarily unavailable (status 503): maintenance"
        );
    }
}
