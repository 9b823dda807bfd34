//! Error types for radiostream
//!
//! Centralized error handling using thiserror. Every error maps to an
//! [`ErrorKind`] which decides whether the retry policy may restart the
//! session.

use std::fmt;

use thiserror::Error;

/// Main error type for the radiostream engine
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    #[error("No internet connectivity: {0}")]
    NoConnectivity(String),

    #[error("Invalid station: {0}")]
    InvalidStation(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Codec excluded for this station: {0}")]
    ExcludedCodec(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Buffer underrun: {0}")]
    Underrun(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias for radiostream
pub type Result<T> = std::result::Result<T, RadioError>;

/// Classification of failures, as surfaced to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoConnectivity,
    InvalidStation,
    UnsupportedCodec,
    ExcludedCodec,
    IngestFailure,
    DecodeFailure,
    BufferUnderrun,
    /// Audio device could not be opened or driven
    Output,
    Config,
}

impl ErrorKind {
    /// Whether the retry policy may restart a session that failed this way
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::IngestFailure | ErrorKind::DecodeFailure | ErrorKind::BufferUnderrun
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoConnectivity => "no connectivity",
            ErrorKind::InvalidStation => "invalid station",
            ErrorKind::UnsupportedCodec => "unsupported codec",
            ErrorKind::ExcludedCodec => "excluded codec",
            ErrorKind::IngestFailure => "ingest failure",
            ErrorKind::DecodeFailure => "decode failure",
            ErrorKind::BufferUnderrun => "buffer underrun",
            ErrorKind::Output => "audio output",
            ErrorKind::Config => "configuration",
        };
        f.write_str(name)
    }
}

impl RadioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RadioError::Network(_)
            | RadioError::Stream(_)
            | RadioError::Io(_)
            | RadioError::Timeout(_) => ErrorKind::IngestFailure,
            RadioError::NoConnectivity(_) => ErrorKind::NoConnectivity,
            RadioError::InvalidStation(_) => ErrorKind::InvalidStation,
            RadioError::UnsupportedCodec(_) => ErrorKind::UnsupportedCodec,
            RadioError::ExcludedCodec(_) => ErrorKind::ExcludedCodec,
            RadioError::Decode(_) => ErrorKind::DecodeFailure,
            RadioError::Underrun(_) => ErrorKind::BufferUnderrun,
            RadioError::Audio(_) => ErrorKind::Output,
            RadioError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Cloneable record of an error that crossed a thread boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&RadioError> for Failure {
    fn from(e: &RadioError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<RadioError> for Failure {
    fn from(e: RadioError) -> Self {
        Self::from(&e)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    if e.is_status() {
        if let Some(status) = e.status() {
            return format!("Server responded with HTTP {status}");
        }
    }
    format!("Network error: {e}")
}
