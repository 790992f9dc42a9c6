//! Operator module — REST + WebSocket API surface for the telemetry
//! middleware: live topology/state reads, command submission, and
//! historical queries, documented with Swagger UI.

mod routes;

pub use routes::{create_router, AppState};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for `POST /api/commands`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandSubmission {
    pub device_id: String,
    pub device_type: crate::types::DeviceType,
    pub message_type: crate::types::MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

/// Generic API response envelope for handler-level success/failure results
/// that aren't tied to a specific resource shape.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The `{error:string}` shape every HTTP error response uses, including
/// the 400 a malformed or incomplete `POST /api/commands` body produces.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
