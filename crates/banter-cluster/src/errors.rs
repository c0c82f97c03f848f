//! Error types for the cluster bridge.

use banter_core::errors::codes;

/// Errors surfaced by bridge operations and the broker transport.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The underlying socket failed.
    #[error("broker i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A request did not complete within the configured deadline.
    #[error("broker request timed out")]
    Timeout,

    /// The bridge is degraded and cannot reach the broker.
    #[error("broker unavailable")]
    BrokerUnavailable,

    /// The connection dropped while a request was in flight.
    #[error("broker connection lost mid-request")]
    ConnectionLost,

    /// The broker rejected our HELLO exchange.
    #[error("broker handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(String),

    /// The peer replied with a frame that does not fit the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The bridge has been shut down.
    #[error("bridge closed")]
    Closed,
}

impl ClusterError {
    /// Stable status code reported to clients when a bridge failure
    /// bubbles up through a subscribe or publish path.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HandshakeRejected(_) | Self::Codec(_) | Self::Protocol(_) => {
                codes::INVALID_FRAME
            }
            _ => codes::BROKER_UNAVAILABLE,
        }
    }

    /// True when the failure is transient and a retry after reconnect
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout | Self::BrokerUnavailable | Self::ConnectionLost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_broker_unavailable_for_transport_failures() {
        assert_eq!(ClusterError::Timeout.code(), codes::BROKER_UNAVAILABLE);
        assert_eq!(
            ClusterError::BrokerUnavailable.code(),
            codes::BROKER_UNAVAILABLE
        );
        assert_eq!(
            ClusterError::ConnectionLost.code(),
            codes::BROKER_UNAVAILABLE
        );
    }

    #[test]
    fn codes_map_to_invalid_frame_for_protocol_failures() {
        assert_eq!(
            ClusterError::Codec("bad length".into()).code(),
            codes::INVALID_FRAME
        );
        assert_eq!(
            ClusterError::Protocol("unexpected response".into()).code(),
            codes::INVALID_FRAME
        );
    }

    #[test]
    fn retryable_covers_transient_failures_only() {
        assert!(ClusterError::Timeout.is_retryable());
        assert!(ClusterError::BrokerUnavailable.is_retryable());
        assert!(!ClusterError::Closed.is_retryable());
        assert!(!ClusterError::HandshakeRejected("version".into()).is_retryable());
    }
}
