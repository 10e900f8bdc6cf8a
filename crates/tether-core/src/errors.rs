/// Typed error hierarchy for the realtime transport layer.
/// Only conditions the caller must act on escalate through callbacks;
/// recoverable conditions are absorbed inside the clients.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    // Fatal: the caller must re-authenticate
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // Fatal: request rejected by the server
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    // The request never produced a response
    #[error("network error: {0}")]
    Network(String),

    // Handshake or wire contract violation
    #[error("protocol error: {0}")]
    Protocol(String),

    // The owning client went away mid-operation
    #[error("channel closed")]
    ChannelClosed,
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http { status: 500..=599, .. }
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::Protocol(_) => "protocol",
            Self::ChannelClosed => "channel_closed",
        }
    }

    /// Classify a non-2xx HTTP status into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized(body),
            _ => Self::Http { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_401_maps_to_unauthorized() {
        let err = TransportError::from_status(401, "token expired".into());
        assert!(err.is_auth());
        assert_eq!(err.error_kind(), "unauthorized");
    }

    #[test]
    fn other_statuses_map_to_http() {
        let err = TransportError::from_status(503, "unavailable".into());
        assert!(matches!(err, TransportError::Http { status: 503, .. }));
        assert!(!err.is_auth());
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::from_status(500, "internal".into()).is_retryable());
        assert!(!TransportError::from_status(404, "missing".into()).is_retryable());
        assert!(!TransportError::Unauthorized("nope".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(TransportError::ChannelClosed.error_kind(), "channel_closed");
        assert_eq!(TransportError::Protocol("bad".into()).error_kind(), "protocol");
        assert_eq!(TransportError::Network("x".into()).error_kind(), "network");
    }

    #[test]
    fn display_includes_status_and_body() {
        let err = TransportError::from_status(500, "boom".into());
        assert_eq!(err.to_string(), "http error 500: boom");
    }
}
