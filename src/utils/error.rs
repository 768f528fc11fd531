use ruma::api::client::error::ErrorKind;
use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every cross-component call returns one of these kinds instead of a bare
/// string: transient remote failures, configuration errors, authorization
/// errors, conflicts, and fatal startup errors each get their own variant
/// (or family of variants) so callers can match on what kind of failure
/// they're looking at, per the error handling design.
#[derive(Error, Debug)]
pub enum Error {
    #[error("There was a problem with the connection to the sqlite database: {source}")]
    SqliteError {
        #[from]
        source: rusqlite::Error,
    },
    #[error("Could not reach the homeserver: {source}")]
    ReqwestError {
        #[from]
        source: reqwest::Error,
    },
    #[error("Could not build regular expression: {source}")]
    RegexError {
        #[from]
        source: regex::Error,
    },
    #[error("Could not do this io: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("{0}")]
    BadServerResponse(&'static str),
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{0}")]
    /// Don't create this directly. Use Error::bad_database instead.
    BadDatabase(&'static str),
    #[error("{n}: {1}", n = _0.errcode())]
    BadRequest(ErrorKind, &'static str),
    #[error("{0}")]
    Conflict(&'static str), // an automatic action found a rule/ban already in place
    #[error("{0}")]
    /// A dynamic, per-request forbidden reason (invite/join admission denials
    /// quote the matched rule's reason text, which isn't `'static`).
    Forbidden(String),
    #[error("{0}")]
    AdminCommand(&'static str),
    #[error("event id mismatch: client claimed {0}, computed {1}")]
    EventIdMismatch(String, String),
    #[error("pdu body exceeds the size limit")]
    PduTooLarge,
    #[error("appservice handshake rejected: {0}")]
    AppserviceHandshakeRejected(&'static str),
    #[error("failed to sign event: {0}")]
    SigningFailed(String),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("BadDatabase: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    /// The Matrix `errcode` this error maps onto for the admission/policy
    /// server HTTP surface.
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::BadRequest(kind, _) => kind.errcode(),
            Self::Forbidden(_) => "M_FORBIDDEN",
            Self::Conflict(_) => "M_CONFLICT",
            Self::PduTooLarge => "M_TOO_LARGE",
            Self::EventIdMismatch(..) => "M_INVALID_PARAM",
            Self::AppserviceHandshakeRejected(_) => "M_FORBIDDEN",
            _ => "M_UNKNOWN",
        }
    }

    /// Sanitizes public-facing errors that can leak sensitive information.
    pub fn sanitized_error(&self) -> String {
        let db_error = String::from("Database or I/O error occurred.");

        match self {
            Self::SqliteError { .. } => db_error,
            Self::IoError { .. } => db_error,
            Self::BadConfig { .. } => db_error,
            Self::BadDatabase { .. } => db_error,
            _ => self.to_string(),
        }
    }
}

#[cfg(feature = "meowlnir_bin")]
mod axum_impl {
    use axum::{
        response::{IntoResponse, Response},
        Json,
    };
    use http::StatusCode;
    use ruma::api::client::error::ErrorKind;
    use serde_json::json;
    use tracing::info;

    use super::Error;

    fn status_code(error: &Error) -> StatusCode {
        use ErrorKind::{Forbidden, LimitExceeded, MissingToken, NotFound, TooLarge, Unauthorized, Unrecognized, UnknownToken};
        match error {
            Error::BadRequest(kind, _) => match kind {
                Forbidden { .. } => StatusCode::FORBIDDEN,
                Unauthorized | UnknownToken { .. } | MissingToken => StatusCode::UNAUTHORIZED,
                NotFound | Unrecognized => StatusCode::NOT_FOUND,
                LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            },
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PduTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::AppserviceHandshakeRejected(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps this error onto the Matrix-style JSON error body shared by the
    /// admission-callback and policy-server HTTP surfaces.
    impl IntoResponse for Error {
        fn into_response(self) -> Response {
            let status = status_code(&self);
            let message = self.sanitized_error();
            info!(%status, %message, "returning an error response");
            (status, Json(json!({ "errcode": self.errcode(), "error": message }))).into_response()
        }
    }
}
