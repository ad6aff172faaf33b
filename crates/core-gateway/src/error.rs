use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use net_guard::GuardError;
use thiserror::Error;

/// Everything that can stop a gateway request before or while it reaches
/// the upstream.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("upstream bearer is not a valid header value")]
    InvalidBearer,

    #[error("failed to read request body: {0}")]
    Body(#[source] axum::Error),

    #[error("websocket handshake rejected: {message}")]
    Handshake { status: StatusCode, message: String },

    #[error("{0}")]
    Upstream(#[from] reqwest::Error),

    #[error("{0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("upstream refused websocket: {status}")]
    UpstreamRefused { status: StatusCode },
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Guard(err) => {
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::InvalidBearer | GatewayError::Body(_) => StatusCode::BAD_REQUEST,
            GatewayError::Handshake { status, .. } => *status,
            GatewayError::Upstream(_) | GatewayError::Dial(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamRefused { status } => *status,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_errors_keep_their_status() {
        assert_eq!(
            GatewayError::from(GuardError::Missing).status_code(),
            StatusCode::BAD_REQUEST
        );
        let err = GatewayError::from(GuardError::NotLoopback {
            host: "example.com".into(),
        });
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn refused_upgrade_relays_upstream_status() {
        let err = GatewayError::UpstreamRefused {
            status: StatusCode::UNAUTHORIZED,
        };
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
