use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "room_not_found",
///     "message": "Room 'abc123' does not exist.",
///     "status": 404
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log according to severity.
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

// ─── Generic constructors ───────────────────────────────────────────────────

impl ApiError {
    /// 400 Bad Request with a custom message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            code: "validation",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: msg.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "internal_error",
            message: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// 404 — the requested room does not exist.
    pub fn room_not_found(room_id: &str) -> Self {
        Self {
            code: "room_not_found",
            message: format!("Room '{room_id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 404 — the requested upload does not exist.
    pub fn upload_not_found(upload_id: &str) -> Self {
        Self {
            code: "upload_not_found",
            message: format!("Upload '{upload_id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 403 — the supplied session token is missing or not valid for the room.
    pub fn token_invalid() -> Self {
        Self {
            code: "token_invalid",
            message: "The provided session token is not valid.".into(),
            status: StatusCode::FORBIDDEN,
        }
    }

    /// 403 — the member behind the token is not the host.
    pub fn not_host() -> Self {
        Self {
            code: "not_host",
            message: "Only the session host may perform this operation.".into(),
            status: StatusCode::FORBIDDEN,
        }
    }

    /// 403 — the session has already ended.
    pub fn session_ended(room_id: &str) -> Self {
        Self {
            code: "session_ended",
            message: format!("Session '{room_id}' has already ended."),
            status: StatusCode::FORBIDDEN,
        }
    }

    /// 409 — another session is already active on this server.
    pub fn session_active() -> Self {
        Self {
            code: "session_active",
            message: "A session is already active on this server.".into(),
            status: StatusCode::CONFLICT,
        }
    }

    /// 409 — the room is busy post-processing an earlier upload.
    pub fn processing_in_progress(room_id: &str) -> Self {
        Self {
            code: "processing_in_progress",
            message: format!("Room '{room_id}' is still processing a previous upload."),
            status: StatusCode::CONFLICT,
        }
    }

    /// 400 — a numeric field is out of its allowed range.
    pub fn out_of_range(field: &str) -> Self {
        Self {
            code: "out_of_range",
            message: format!("Field '{field}' is out of range."),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::room_not_found("abc123")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "room_not_found");
        assert_eq!(value["error"]["message"], "Room 'abc123' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_code_is_set() {
        let response = ApiError::not_host().into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn conflict_when_session_active() {
        let json = body_string(ApiError::session_active()).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "session_active");
        assert_eq!(value["error"]["status"], 409);
    }

    #[tokio::test]
    async fn internal_error_500() {
        let response = ApiError::internal("disk on fire").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn validation_is_400() {
        let json = body_string(ApiError::out_of_range("rating")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"]["status"], 400);
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("rating"));
    }
}
