//! Error types for the Proxmox API layer.

use thiserror::Error;

/// Status code the PVE proxy uses when the guest agent cannot be reached.
const STATUS_AGENT_UNREACHABLE: u16 = 596;

/// Errors that can occur when talking to the Proxmox control API.
#[derive(Error, Debug)]
pub enum ProxmoxError {
    /// Non-2xx response from the API. Carries the numeric status and the
    /// raw response body so callers can classify the failure.
    #[error("Proxmox API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure (connect, timeout, I/O).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request could not be built (e.g. empty guest command).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ProxmoxError {
    /// Build an API error from a status and raw body.
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// The resource (node/VM) does not exist on the cluster.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// The VM exists but its guest agent did not answer. The PVE proxy
    /// reports this as 596; some setups surface it as a 500 with a
    /// recognizable message instead.
    pub fn is_agent_unreachable(&self) -> bool {
        match self {
            Self::Api {
                status: STATUS_AGENT_UNREACHABLE,
                ..
            } => true,
            Self::Api { status: 500, body } => body.contains("guest agent is not running"),
            _ => false,
        }
    }

    /// Generic 4xx, excluding not-found.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Api { status, .. } if (400..500).contains(status))
    }
}

/// Whether a transport error is worth one retry. API-level failures are
/// never retried at this layer.
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Result type alias for Proxmox API operations.
pub type Result<T> = std::result::Result<T, ProxmoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(ProxmoxError::api(404, "no such VM").is_not_found());
        assert!(!ProxmoxError::api(500, "boom").is_not_found());
    }

    #[test]
    fn agent_unreachable_classification() {
        assert!(ProxmoxError::api(596, "").is_agent_unreachable());
        assert!(
            ProxmoxError::api(500, "QEMU guest agent is not running").is_agent_unreachable()
        );
        assert!(!ProxmoxError::api(500, "internal error").is_agent_unreachable());
        assert!(!ProxmoxError::api(404, "").is_agent_unreachable());
    }

    #[test]
    fn api_error_keeps_raw_body() {
        let err = ProxmoxError::api(400, "parameter verification failed");
        assert_eq!(
            err.to_string(),
            "Proxmox API error 400: parameter verification failed"
        );
    }
}
