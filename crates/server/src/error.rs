use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use huddle_agent::runtime::AgentError;
use huddle_core::errors::{ApplicationError, DomainError, InterfaceError};
use serde_json::json;
use tracing::error;

/// HTTP-facing error; wraps the interface layer of the error taxonomy.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.into(),
        })
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self(InterfaceError::Unauthorized {
            message: message.into(),
            correlation_id: "unassigned".to_string(),
        })
    }

    pub fn from_agent(error: AgentError, correlation_id: &str) -> Self {
        let application = match error {
            AgentError::EmptyConversation => ApplicationError::Domain(
                DomainError::InvariantViolation("conversation has no user message".to_string()),
            ),
            AgentError::Llm(error) => ApplicationError::Provider(error.to_string()),
            // Phase bookkeeping bugs are ours, never the caller's.
            AgentError::Transition(error) => {
                return Self(InterfaceError::Internal {
                    message: error.to_string(),
                    correlation_id: correlation_id.to_string(),
                });
            }
        };
        Self(application.into_interface(correlation_id))
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                event_name = "server.request.failed",
                correlation_id = self.0.correlation_id(),
                status = status.as_u16(),
                detail = self.0.detail(),
                "request failed"
            );
        }
        let body = json!({
            "status": "error",
            "error": self.0.user_message(),
            "detail": self.0.detail(),
            "correlation_id": self.0.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}
