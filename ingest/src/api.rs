use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body returned on success. Clients only check for `{"status": 1}`.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngestResponse {
    pub status: u32,
}

impl IngestResponse {
    pub fn ok() -> Self {
        IngestResponse { status: 1 }
    }
}

impl IntoResponse for IngestResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Error body shape shared by every rejection, so that SDKs can switch on
/// `code` and surface `detail` to users. `attr` names the offending field
/// for `required` errors.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub detail: String,
    pub attr: Option<String>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed request data: {0}")]
    RequestDecodingError(String),
    #[error("malformed request data: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("malformed sent_at value: {0}")]
    InvalidSentAt(String),
    #[error("invalid session recording payload: {0}")]
    InvalidSessionPayload(String),

    #[error("no data found. Make sure to use a POST request when sending the payload in the body of the request")]
    NoData,

    #[error("API key not provided. You can find your project API key in your project settings")]
    NoTokenError,
    #[error("invalid project ID")]
    InvalidProjectId,
    #[error("project API key invalid. You can find your project API key in your project settings")]
    InvalidApiKey,
    #[error("invalid personal API key")]
    InvalidPersonalApiKey,

    #[error("you need to set the user distinct ID field `distinct_id`")]
    MissingDistinctId,
    #[error("you need to set the event name field `event`")]
    MissingEventName,

    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum event size exceeded")]
    EventTooBig,
    #[error("invalid event could not be processed")]
    NonRetryableSinkError,

    #[error("tenant store unavailable")]
    StoreUnavailable,
    #[error("request processing deadline exceeded")]
    DeadlineExceeded,
}

impl IngestError {
    /// Stable machine-readable code, mirrored from the legacy API so that
    /// old SDK error handling keeps working.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::RequestDecodingError(_)
            | IngestError::RequestParsingError(_)
            | IngestError::InvalidSentAt(_)
            | IngestError::InvalidSessionPayload(_)
            | IngestError::EventTooBig
            | IngestError::NonRetryableSinkError => "invalid_payload",
            IngestError::NoData => "no_data",
            IngestError::NoTokenError => "missing_api_key",
            IngestError::InvalidProjectId => "invalid_project",
            IngestError::InvalidApiKey => "invalid_api_key",
            IngestError::InvalidPersonalApiKey => "invalid_personal_api_key",
            IngestError::MissingDistinctId | IngestError::MissingEventName => "required",
            IngestError::RetryableSinkError
            | IngestError::StoreUnavailable
            | IngestError::DeadlineExceeded => "server_error",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            IngestError::NoTokenError
            | IngestError::InvalidApiKey
            | IngestError::InvalidPersonalApiKey => "authentication_error",
            IngestError::RetryableSinkError
            | IngestError::StoreUnavailable
            | IngestError::DeadlineExceeded => "server_error",
            _ => "validation_error",
        }
    }

    /// Field the error refers to, for `required` errors.
    pub fn attr(&self) -> Option<&'static str> {
        match self {
            IngestError::MissingDistinctId => Some("distinct_id"),
            IngestError::MissingEventName => Some("event"),
            IngestError::InvalidProjectId => Some("project_id"),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::NoTokenError
            | IngestError::InvalidApiKey
            | IngestError::InvalidPersonalApiKey => StatusCode::UNAUTHORIZED,
            IngestError::RetryableSinkError
            | IngestError::StoreUnavailable
            | IngestError::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Low-cardinality tag for drop/error counters.
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            IngestError::RequestDecodingError(_) => "decoding_error",
            IngestError::RequestParsingError(_) => "parsing_error",
            IngestError::InvalidSentAt(_) => "invalid_sent_at",
            IngestError::InvalidSessionPayload(_) => "invalid_session_payload",
            IngestError::NoData => "no_data",
            IngestError::NoTokenError => "missing_api_key",
            IngestError::InvalidProjectId => "invalid_project",
            IngestError::InvalidApiKey => "invalid_api_key",
            IngestError::InvalidPersonalApiKey => "invalid_personal_api_key",
            IngestError::MissingDistinctId => "missing_distinct_id",
            IngestError::MissingEventName => "missing_event_name",
            IngestError::RetryableSinkError => "retryable_sink_error",
            IngestError::EventTooBig => "event_too_big",
            IngestError::NonRetryableSinkError => "non_retryable_sink_error",
            IngestError::StoreUnavailable => "store_unavailable",
            IngestError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error_type: self.error_type().to_string(),
            code: self.code().to_string(),
            detail: self.to_string(),
            attr: self.attr().map(String::from),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
