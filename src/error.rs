// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::dispatch::DispatchError;
use crate::proxy::ProxyError;
use crate::registry::RegistryError;
use crate::tee::{ReturnCode, ReturnOrigin};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// GlobalPlatform code for callers that speak TEEC results.
    pub return_code: Option<ReturnCode>,
    pub return_origin: Option<ReturnOrigin>,
}

/// JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<ReturnCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_origin: Option<ReturnOrigin>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            return_code: None,
            return_origin: None,
        }
    }

    pub fn with_return(mut self, code: ReturnCode, origin: ReturnOrigin) -> Self {
        self.return_code = Some(code);
        self.return_origin = Some(origin);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        let status = match &error {
            ProxyError::UnknownCaller(_) => StatusCode::FORBIDDEN,
            ProxyError::BadParameters(_) => StatusCode::BAD_REQUEST,
            ProxyError::OutOfMemory { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Registry(RegistryError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ProxyError::Registry(RegistryError::AlreadyDestroyed(_)) => StatusCode::GONE,
            ProxyError::Registry(_) => StatusCode::CONFLICT,
            ProxyError::Bridge(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, error.to_string()).with_return(error.return_code(), error.return_origin())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            ReturnCode::OUT_OF_MEMORY
        } else {
            ReturnCode::BAD_FORMAT
        };
        Self::new(status, rejection.body_text()).with_return(code, ReturnOrigin::Api)
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self::unavailable(error.to_string()).with_return(ReturnCode::BUSY, ReturnOrigin::Api)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            return_code: self.return_code,
            return_origin: self.return_origin,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use crate::ids::CallerId;

    #[test]
    fn constructors_set_status_and_message() {
        let bad = ApiError::bad_request("bad");
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        assert_eq!(bad.message, "bad");

        let unauth = ApiError::unauthorized("who");
        assert_eq!(unauth.status, StatusCode::UNAUTHORIZED);
        assert_eq!(unauth.return_code, None);
    }

    #[test]
    fn proxy_errors_carry_return_codes() {
        let err = ApiError::from(ProxyError::UnknownCaller(CallerId(12)));
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.return_code, Some(ReturnCode::ACCESS_DENIED));
        assert_eq!(err.return_origin, Some(ReturnOrigin::Api));

        let err = ApiError::from(ProxyError::OutOfMemory { size: 10, limit: 5 });
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }

    #[tokio::test]
    async fn return_code_is_echoed_in_body() {
        let response = ApiError::bad_request("bad")
            .with_return(ReturnCode::BAD_PARAMETERS, ReturnOrigin::Api)
            .into_response();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["return_code"], 0xFFFF_0006u32);
        assert_eq!(body["return_origin"], "api");
    }
}
