//! Error types and helpers for mapping errors to HTTP responses.
//!
//! The [`ApiError`] type carries an HTTP status code, a message, and an
//! optional machine-readable detail payload (used for validation issues).
//! Use [`ResultExt`] to attach status codes to `anyhow::Error` chains,
//! or the [`client_bail!`] and [`status_bail!`] macros for early returns.

use serde::Serialize;
use serde_json::Value;
use std::fmt::{Debug, Display, Formatter};
use warp::http::StatusCode;
use warp::reject::Reject;

/// An error that can be serialized to JSON and returned as an HTTP response.
///
/// The `status` field determines the HTTP status code but is not serialized.
/// `details` carries machine-readable context: the pipeline fills it with
/// the validation issue list for unprocessable input and leaves it empty for
/// everything else; stack traces and error chains are logged, never sent.
#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// HTTP status code for the response (not serialized).
    #[serde(skip)]
    pub status: StatusCode,
    /// Human-readable error message.
    pub message: String,
    /// Machine-readable detail, e.g. a list of validation issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Reject for ApiError {}

impl ApiError {
    /// Creates a new API error with the given HTTP status and message.
    pub fn new(status: StatusCode, message: impl ToString) -> Self {
        ApiError {
            status,
            message: message.to_string(),
            details: None,
        }
    }

    /// Attaches a machine-readable detail payload.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// An "unprocessable entity" error carrying the given detail payload.
    pub fn unprocessable(message: impl ToString, details: Value) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message).with_details(details)
    }

    /// A generic denial; intentionally carries no further detail.
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authorized to perform this action")
    }

    /// Wraps this error for propagation through `anyhow` chains; the error
    /// funnel recovers it via downcast.
    pub fn into_anyhow(self) -> anyhow::Error {
        anyhow::Error::msg(self)
    }
}

/// Extension trait for attaching HTTP status codes to error results.
pub trait ResultExt<T> {
    /// Wraps the error with an [`ApiError`] carrying the given status code.
    fn with_status(self, status: StatusCode) -> Result<T, anyhow::Error>;

    /// Convenience method for `with_status(StatusCode::BAD_REQUEST)`.
    fn mark_client_error(self) -> Result<T, anyhow::Error>;

    /// Convenience method for `with_status(StatusCode::UNAUTHORIZED)`.
    fn mark_unauthorized(self) -> Result<T, anyhow::Error>;
}

impl<T> ResultExt<T> for Result<T, anyhow::Error> {
    fn with_status(self, status: StatusCode) -> Result<T, anyhow::Error> {
        match self {
            Ok(t) => Ok(t),
            Err(err) => {
                let message = format!("{:#}", err);
                Err(err.context(ApiError {
                    status,
                    message,
                    details: None,
                }))
            }
        }
    }

    fn mark_client_error(self) -> Result<T, anyhow::Error> {
        self.with_status(StatusCode::BAD_REQUEST)
    }

    fn mark_unauthorized(self) -> Result<T, anyhow::Error> {
        self.with_status(StatusCode::UNAUTHORIZED)
    }
}

/// Early return with a 400 Bad Request error.
#[macro_export]
macro_rules! client_bail {
    ($err:expr $(,)?) => {
        return $crate::web::error::ResultExt::mark_client_error(Err(::anyhow::anyhow!($err)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return $crate::web::error::ResultExt::mark_client_error(Err(::anyhow::anyhow!($fmt, $($arg)*)))
    };
}

/// Early return with a custom HTTP status code.
#[macro_export]
macro_rules! status_bail {
    ($status:expr, $msg:literal $(,)?) => {
        return $crate::web::error::ResultExt::with_status(Err(::anyhow::anyhow!($msg)), $status)
    };
    ($status:expr, $fmt:literal, $($arg:tt)*) => {
        return $crate::web::error::ResultExt::with_status(Err(::anyhow::anyhow!($fmt, $($arg)*)), $status)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn with_status_preserves_the_message_chain() {
        let result: Result<(), anyhow::Error> =
            Err(anyhow!("the disk is on fire")).with_status(StatusCode::SERVICE_UNAVAILABLE);

        let err = result.unwrap_err();
        let api_error = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(api_error.message.contains("the disk is on fire"));
    }

    #[test]
    fn details_are_serialized_only_when_present() {
        let bare = ApiError::new(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(serde_json::to_value(&bare).unwrap(), serde_json::json!({"message": "nope"}));

        let detailed = ApiError::unprocessable("invalid", serde_json::json!([{"path": ["email"]}]));
        let json = serde_json::to_value(&detailed).unwrap();
        assert_eq!(json["details"][0]["path"][0], "email");
    }

    #[test]
    fn unauthorized_has_no_details() {
        let err = ApiError::unauthorized();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(err.details.is_none());
    }
}
