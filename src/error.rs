//! Error types for the secrets decryption webhook

use thiserror::Error;

use crate::kms::BackendError;

/// Errors raised while handling an admission review.
///
/// The variants fall into two classes. Protocol errors happen before the
/// request uid is known and are reported as a bare HTTP 500. Every other
/// request-scoped error is reported as a denied `AdmissionResponse`.
#[derive(Error, Debug)]
pub enum Error {
    /// The request did not declare `application/json`
    #[error("contentType={0}, expect application/json")]
    UnsupportedMediaType(String),

    /// The body is not an `AdmissionReview` this webhook understands
    #[error("failed to decode body: {0}")]
    Decode(String),

    /// The review has no `request` member
    #[error("unexpected nil request")]
    MissingRequest,

    /// The embedded object could not be deserialized
    #[error("request object is not materialized and decoding the raw object failed: {0}")]
    Deserialization(String),

    /// The embedded object is not a v1 Secret
    #[error("admission review does not contain a v1 Secret, got {0}")]
    UnexpectedType(String),

    /// The decryption backend failed for one data key
    #[error("failed to decrypt data key {key:?}: {source}")]
    Decryption {
        key: String,
        #[source]
        source: BackendError,
    },

    /// The response or patch could not be serialized
    #[error("unexpected encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Listener or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OpenTelemetry pipeline could not be installed
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    /// True when no uid can be echoed and the failure must surface as HTTP 500.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedMediaType(_)
                | Error::Decode(_)
                | Error::MissingRequest
                | Error::Encoding(_)
                | Error::ConfigError(_)
                | Error::Io(_)
                | Error::Telemetry(_)
        )
    }

    /// Machine readable reason carried in the denial status.
    ///
    /// Only request scoped errors reach a denial; protocol errors all map to
    /// `InternalError`.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Deserialization(_) | Error::UnexpectedType(_) => "Invalid",
            Error::Decryption { .. } => "DecryptionFailed",
            _ => "InternalError",
        }
    }

    /// HTTP style code carried in the denial status.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Deserialization(_) | Error::UnexpectedType(_) => 400,
            Error::Decryption { .. } => 403,
            _ => 500,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedMediaType(_) | Error::Decode(_) | Error::MissingRequest => {
                "protocol"
            }
            Error::Deserialization(_) | Error::UnexpectedType(_) => "validation",
            Error::Decryption { .. } => "decryption",
            Error::Encoding(_) => "encoding",
            Error::ConfigError(_) | Error::Io(_) | Error::Telemetry(_) => "internal",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
