use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Transport-level failure reported by a [`crate::mqtt::Bus`] implementation.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),

    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Outcome of a command or status query that did not succeed.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("action '{action}' is not valid for device {device}")]
    InvalidAction { device: String, action: String },

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("failed to subscribe to {topic}: {source}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("failed to publish to {topic}: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("timeout waiting for {device} status after {after:?}")]
    Timeout { device: String, after: Duration },
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownDevice(_) => StatusCode::NOT_FOUND,
            Self::InvalidAction { .. } => StatusCode::BAD_REQUEST,
            Self::TransportUnavailable(_)
            | Self::SubscribeFailed { .. }
            | Self::PublishFailed { .. }
            | Self::Timeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            GatewayError::UnknownDevice("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::InvalidAction {
                device: "x".into(),
                action: "open".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        let timeout = GatewayError::Timeout {
            device: "lamp1".into(),
            after: Duration::from_secs(2),
        };
        assert_eq!(timeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(timeout.to_string().contains("lamp1"));
    }

    #[test]
    fn publish_failure_keeps_its_source() {
        let err = GatewayError::PublishFailed {
            topic: "iot/lamp1/set".into(),
            source: BusError::NotConnected,
        };
        let message = err.to_string();
        assert!(message.contains("iot/lamp1/set"));
        assert!(message.contains("not connected"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
