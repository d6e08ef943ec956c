//! REST error envelope
//!
//! Every failure leaves the server as
//! `{"error": {"kind": ..., "stage": ..., "message": ...}}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use voice_gateway_core::{AuthFailure, Error, Stage, StageError};
use voice_gateway_pipeline::ErrorPayload;

/// Kind and stage of a failed response, read back by the request logger
#[derive(Debug, Clone)]
pub struct ErrorTag {
    pub kind: &'static str,
    pub stage: Option<Stage>,
}

#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        ApiError(Error::invalid_input(message))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Unauthorized(AuthFailure::Missing) => StatusCode::UNAUTHORIZED,
            Error::Unauthorized(AuthFailure::Invalid) => StatusCode::FORBIDDEN,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            // An engine rejecting what we forwarded is a gateway failure
            Error::InvalidInput { stage: Some(_), .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidInput { stage: None, .. } => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": ErrorPayload::from(&self.0) });
        let mut response = (status, Json(body)).into_response();

        if let Error::RateLimited { retry_after_secs } = &self.0 {
            let secs = (retry_after_secs.ceil() as u64).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response.extensions_mut().insert(ErrorTag {
            kind: self.0.kind(),
            stage: self.0.stage(),
        });
        response
    }
}
