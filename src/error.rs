//! Error taxonomy shared by the ingestion path and the query surface.

/// Errors raised by relay links, the parser and the query service.
///
/// Only `NotFound` and `InvalidArgument` ever reach a tool caller; the other
/// two are logged and counted by the ingestion path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Relay unreachable or disconnected; retried with backoff.
    #[error("relay unavailable: {0}")]
    TransientNetwork(String),

    /// Event failed parsing or validation; dropped.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// No current listing carries the requested id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Stable variant name reported in tool-error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransientNetwork(_) => "TransientNetworkError",
            Error::MalformedEvent(_) => "MalformedEvent",
            Error::NotFound(_) => "NotFound",
            Error::InvalidArgument(_) => "InvalidArgument",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::TransientNetwork(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransientNetwork(e.to_string())
    }
}

impl From<tokio_socks::Error> for Error {
    fn from(e: tokio_socks::Error) -> Self {
        Error::TransientNetwork(format!("socks proxy: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let e = Error::NotFound("abc".into());
        assert_eq!(e.kind(), "NotFound");
        assert_eq!(e.to_string(), "job not found: abc");
        let e = Error::InvalidArgument("skill must not be empty".into());
        assert_eq!(e.kind(), "InvalidArgument");
        assert_eq!(
            e.to_string(),
            "invalid argument: skill must not be empty"
        );
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: Error = io.into();
        assert_eq!(e.kind(), "TransientNetworkError");
    }
}
