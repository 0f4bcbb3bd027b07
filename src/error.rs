use std::fmt::Display;

use hyper::http::uri::InvalidUri;
use hyper::StatusCode;
use tracing::{error, warn};

/// Struct to represent when the library encounters an error,
///
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Category of error, every error the library surfaces carries exactly one of these,
///
/// Callers match on the kind to decide whether to retry, fall back, or fail.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A reference string could not be parsed
    InvalidReference,
    /// A digest string could not be parsed, or used an unsupported algorithm
    InvalidDigest,
    /// An OCI layout directory is missing or declares an unsupported version
    InvalidLayout,
    /// The referenced artifact does not exist
    NotFound,
    /// The request was not authorized
    Unauthorized,
    /// The request was authenticated but not permitted
    Forbidden,
    /// The manifest variant does not support the requested operation
    UnsupportedMediaType,
    /// The computed digest differs from the declared digest
    DigestMismatch,
    /// The declared length differs from the number of bytes read
    SizeMismatch,
    /// The deadline elapsed or the caller canceled the operation
    Canceled,
    /// A network-level failure, subject to retry
    Transport,
    /// A terminal non-2xx response
    StatusCode(u16),
    /// Every mirror was exhausted without a successful exchange
    AllRequestsFailed,
    /// The operation requires a tag the reference does not carry
    MissingTag,
    /// The operation requires a digest the reference does not carry
    MissingDigest,
    /// The operation requires a tag or digest the reference does not carry
    MissingTagOrDigest,
    /// A challenge update matched the cached challenge, authentication cannot make progress
    NoNewChallenge,
    /// The manifest body has not been populated
    Unavailable,
    /// A header or document could not be parsed
    ParseFailure,
}

impl Error {
    /// Returns a new error with only a kind,
    ///
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: None,
            source: None,
        }
    }

    /// Attaches a human-readable message, chainable
    ///
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches the underlying cause, chainable
    ///
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns the kind of this error,
    ///
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns true when the kind matches,
    ///
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// A reference string was rejected,
    ///
    pub fn invalid_reference(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidReference).with_message(reason)
    }

    /// A digest string was rejected,
    ///
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidDigest).with_message(reason)
    }

    /// The directory is not a usable OCI layout,
    ///
    pub fn invalid_layout(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidLayout).with_message(reason)
    }

    /// The referenced content is not there, search for your value elsewhere,
    ///
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound).with_message(what)
    }

    /// The request was not authorized,
    ///
    pub fn unauthorized() -> Self {
        Error::new(ErrorKind::Unauthorized)
    }

    /// The computed digest did not match what was declared,
    ///
    pub fn digest_mismatch(expected: impl Display, computed: impl Display) -> Self {
        warn!("Digest mismatch, expected {expected}, computed {computed}");
        Error::new(ErrorKind::DigestMismatch)
            .with_message(format!("expected {expected}, computed {computed}"))
    }

    /// Fewer or more bytes arrived than were declared,
    ///
    pub fn size_mismatch(expected: u64, received: u64) -> Self {
        Error::new(ErrorKind::SizeMismatch)
            .with_message(format!("expected {expected} bytes, received {received}"))
    }

    /// The caller canceled or the deadline elapsed,
    ///
    pub fn canceled() -> Self {
        Error::new(ErrorKind::Canceled)
    }

    /// A network failure that the retry engine may recover from,
    ///
    pub fn transport(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::Transport).with_message(reason)
    }

    /// A terminal status code, with the registry's error body folded into the message,
    ///
    pub fn status_code(status: StatusCode, body: impl Into<String>) -> Self {
        Error::new(ErrorKind::StatusCode(status.as_u16())).with_message(body)
    }

    /// Every candidate mirror failed,
    ///
    pub fn all_requests_failed() -> Self {
        error!("All requests failed");
        Error::new(ErrorKind::AllRequestsFailed)
    }

    /// The manifest variant cannot answer this operation,
    ///
    pub fn unsupported_media_type(media_type: impl Display) -> Self {
        Error::new(ErrorKind::UnsupportedMediaType).with_message(format!("media type {media_type}"))
    }

    /// A header or document could not be parsed,
    ///
    pub fn parse_failure(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::ParseFailure).with_message(reason)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::StatusCode(code) => write!(f, "status code {code}")?,
            kind => write!(f, "{kind:?}")?,
        }
        if let Some(message) = self.message.as_ref() {
            write!(f, ", {message}")?;
        }
        if let Some(source) = self.source.as_ref() {
            write!(f, ", caused by: {source}")?;
        }
        Ok(())
    }
}

impl From<InvalidUri> for Error {
    fn from(value: InvalidUri) -> Self {
        error!("Error parsing uri, {value}");
        Self::parse_failure("invalid uri").with_source(value)
    }
}

impl From<hyper::Error> for Error {
    fn from(value: hyper::Error) -> Self {
        error!("Error making http request, {value}");
        Self::transport("http request failed").with_source(value)
    }
}

impl From<hyper::http::Error> for Error {
    fn from(value: hyper::http::Error) -> Self {
        error!("Error building http request, {value}");
        Self::transport("http request could not be built").with_source(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        error!("Error w/ system i/o, {value}");
        Self::transport("i/o failure").with_source(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        error!("Error with json serialization, {value}");
        Self::parse_failure("json serialization failed").with_source(value)
    }
}
