//! Bus error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use filecache_core::CoreError;
use serde_json::{Value, json};
use thiserror::Error;

pub const ERR_INVALID_ARGUMENT: i32 = -100;
pub const ERR_TYPE_NOT_FOUND: i32 = -101;
pub const ERR_INSUFFICIENT_SPACE: i32 = -102;
pub const ERR_INVALID_DESTINATION: i32 = -103;
pub const ERR_TIMEOUT: i32 = -104;
pub const ERR_INTERNAL: i32 = -105;
pub const ERR_UNKNOWN_COMMAND: i32 = -106;
pub const ERR_DESTINATION_FULL: i32 = -190;
pub const ERR_OBJECT_NOT_FOUND: i32 = -199;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl BusError {
    /// Numeric code carried in the error reply
    pub fn error_code(&self) -> i32 {
        match self {
            BusError::InvalidArgs(_) => ERR_INVALID_ARGUMENT,
            BusError::UnknownCommand(_) | BusError::UnknownService(_) => ERR_UNKNOWN_COMMAND,
            BusError::Core(e) => match e {
                CoreError::InvalidArgument(_) => ERR_INVALID_ARGUMENT,
                CoreError::TypeNotFound(_) => ERR_TYPE_NOT_FOUND,
                CoreError::InsufficientSpace(_) => ERR_INSUFFICIENT_SPACE,
                CoreError::InvalidDestination(_) => ERR_INVALID_DESTINATION,
                CoreError::Timeout(_) => ERR_TIMEOUT,
                CoreError::DestinationFull(_) => ERR_DESTINATION_FULL,
                CoreError::ObjectNotFound(_) => ERR_OBJECT_NOT_FOUND,
                CoreError::Storage(_) => ERR_INTERNAL,
            },
        }
    }

    fn status(&self) -> StatusCode {
        match self.error_code() {
            ERR_INVALID_ARGUMENT | ERR_INSUFFICIENT_SPACE | ERR_INVALID_DESTINATION => {
                StatusCode::BAD_REQUEST
            }
            ERR_TYPE_NOT_FOUND | ERR_OBJECT_NOT_FOUND | ERR_UNKNOWN_COMMAND => {
                StatusCode::NOT_FOUND
            }
            ERR_DESTINATION_FULL => StatusCode::INSUFFICIENT_STORAGE,
            ERR_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error reply body
    pub fn to_reply(&self) -> Value {
        json!({
            "returnValue": false,
            "errorCode": self.error_code(),
            "errorText": self.to_string(),
        })
    }
}

impl IntoResponse for BusError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(self.to_reply())).into_response()
    }
}
