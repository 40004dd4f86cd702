use crate::errors::{classify_io_error, DomainError, ErrorCode, IoErrorHint};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorCode {
    /// File open or mmap failed; the decoder goes Fatal.
    FatalIo,
    /// `decode_header` failed; the decoder goes Fatal.
    Header,
    /// In-loop failure (corrupt data, unsupported codec setup, allocation
    /// failure); the decoder goes Error and is retryable via reset.
    Decode,
    /// Cooperative cancellation sentinel; not an error, carries no message.
    Cancelled,
    /// Illegal API use (double open, reset while running). Never the
    /// result of bad input data.
    Programming,
}

impl ErrorCode for DecodeErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::FatalIo => "fatal_io",
            Self::Header => "header_error",
            Self::Decode => "decode_error",
            Self::Cancelled => "user_cancellation",
            Self::Programming => "programming_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeError {
    code: DecodeErrorCode,
    message: String,
}

impl DecodeError {
    pub fn new(code: DecodeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(DecodeErrorCode::Cancelled, "")
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DecodeErrorCode::Decode, message)
    }

    pub fn header(message: impl Into<String>) -> Self {
        Self::new(DecodeErrorCode::Header, message)
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(DecodeErrorCode::Programming, message)
    }

    pub fn from_io_error(context: impl Into<String>, error: std::io::Error) -> Self {
        let hint = match classify_io_error(&error) {
            IoErrorHint::NotFound => " (not found)",
            IoErrorHint::PermissionDenied => " (permission denied)",
            _ => "",
        };
        Self::new(
            DecodeErrorCode::FatalIo,
            format!("{}{hint}: {error}", context.into()),
        )
    }

    pub fn code(&self) -> DecodeErrorCode {
        self.code
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == DecodeErrorCode::Cancelled
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecodeError {}

impl DomainError for DecodeError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
