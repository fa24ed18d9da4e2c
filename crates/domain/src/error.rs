use thiserror::Error;

/// Transport-level failure talking to the control plane.
///
/// Carries the original error text unchanged; callers decide whether the
/// failure is fatal (token review, project listing) or degradable (SAR
/// during role evaluation).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ControlPlaneError(pub String);

/// Proxy error taxonomy.
///
/// Each variant carries everything needed to render the structured JSON
/// error body: the HTTP status comes from the kind, the message from the
/// payload. Replaces the legacy `"got <code> <message>"` string convention
/// with a tagged type.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// The control plane reviewed the token and rejected it.
    #[error("{message}")]
    Unauthenticated { message: String },

    /// Neither bearer token nor client certificate yielded an identity.
    #[error("Unable to determine username")]
    IdentityUnresolved,

    /// The control plane could not be reached or answered with an error.
    #[error("control plane request failed: {message}")]
    ControlPlane { message: String },

    /// The upstream cluster could not be reached.
    #[error("upstream unreachable: {message}")]
    UpstreamUnreachable { message: String },

    /// Anything else. Rendered as a generic 500 without internal detail.
    #[error("{message}")]
    Internal { message: String },
}

impl ProxyError {
    /// HTTP status code for the structured error response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated { .. } | Self::IdentityUnresolved => 401,
            Self::ControlPlane { .. } | Self::Internal { .. } => 500,
            Self::UpstreamUnreachable { .. } => 502,
        }
    }

    /// Message surfaced to the caller in the JSON body.
    ///
    /// Internal errors collapse to a fixed string so no internal detail
    /// leaks past the trust boundary.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated { message } => message.clone(),
            Self::IdentityUnresolved => "Unable to determine username".to_string(),
            Self::UpstreamUnreachable { message } => message.clone(),
            Self::ControlPlane { .. } | Self::Internal { .. } => "Internal Error".to_string(),
        }
    }
}

impl From<ControlPlaneError> for ProxyError {
    fn from(err: ControlPlaneError) -> Self {
        Self::ControlPlane { message: err.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let unauth = ProxyError::Unauthenticated {
            message: "token expired".to_string(),
        };
        assert_eq!(unauth.status_code(), 401);
        assert_eq!(ProxyError::IdentityUnresolved.status_code(), 401);
        assert_eq!(
            ProxyError::ControlPlane {
                message: "dial tcp: timeout".to_string()
            }
            .status_code(),
            500
        );
        assert_eq!(
            ProxyError::UpstreamUnreachable {
                message: "connect refused".to_string()
            }
            .status_code(),
            502
        );
    }

    #[test]
    fn unauthenticated_surfaces_review_message() {
        let err = ProxyError::Unauthenticated {
            message: "token expired".to_string(),
        };
        assert_eq!(err.public_message(), "token expired");
    }

    #[test]
    fn internal_detail_is_not_surfaced() {
        let err = ProxyError::ControlPlane {
            message: "dial tcp 10.0.0.1:443: connection refused".to_string(),
        };
        assert_eq!(err.public_message(), "Internal Error");
        // The full detail stays available for logs.
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn identity_unresolved_message() {
        assert_eq!(
            ProxyError::IdentityUnresolved.to_string(),
            "Unable to determine username"
        );
    }

    #[test]
    fn control_plane_error_converts() {
        let err: ProxyError = ControlPlaneError("boom".to_string()).into();
        assert!(matches!(err, ProxyError::ControlPlane { ref message } if message == "boom"));
    }
}
