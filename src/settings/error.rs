use crate::errors::{classify_io_error, DomainError, ErrorCode, IoErrorHint};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsErrorCode {
    DataDirUnavailable,
    PermissionDenied,
    ReadOnlyFilesystem,
    NotFound,
    OpenFailed,
    SchemaInitFailed,
    ReadFailed,
    WriteFailed,
    SerializeFailed,
    ParseFailed,
}

impl ErrorCode for SettingsErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::DataDirUnavailable => "data_dir_unavailable",
            Self::PermissionDenied => "permission_denied",
            Self::ReadOnlyFilesystem => "read_only_filesystem",
            Self::NotFound => "not_found",
            Self::OpenFailed => "open_failed",
            Self::SchemaInitFailed => "schema_init_failed",
            Self::ReadFailed => "read_failed",
            Self::WriteFailed => "write_failed",
            Self::SerializeFailed => "serialize_failed",
            Self::ParseFailed => "parse_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsError {
    code: SettingsErrorCode,
    message: String,
}

impl SettingsError {
    pub fn new(code: SettingsErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> SettingsErrorCode {
        self.code
    }

    pub fn from_io_error(
        fallback: SettingsErrorCode,
        context: impl Into<String>,
        error: std::io::Error,
    ) -> Self {
        let code = match classify_io_error(&error) {
            IoErrorHint::PermissionDenied => SettingsErrorCode::PermissionDenied,
            IoErrorHint::ReadOnlyFilesystem => SettingsErrorCode::ReadOnlyFilesystem,
            IoErrorHint::NotFound => SettingsErrorCode::NotFound,
            _ => fallback,
        };
        Self::new(code, format!("{}: {error}", context.into()))
    }

    pub fn from_sqlite_error(
        fallback: SettingsErrorCode,
        context: impl Into<String>,
        error: rusqlite::Error,
    ) -> Self {
        let code = match &error {
            rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
                rusqlite::ffi::ErrorCode::PermissionDenied => SettingsErrorCode::PermissionDenied,
                rusqlite::ffi::ErrorCode::ReadOnly => SettingsErrorCode::ReadOnlyFilesystem,
                rusqlite::ffi::ErrorCode::NotFound => SettingsErrorCode::NotFound,
                rusqlite::ffi::ErrorCode::CannotOpen => SettingsErrorCode::OpenFailed,
                _ => fallback,
            },
            _ => fallback,
        };
        Self::new(code, format!("{}: {error}", context.into()))
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SettingsError {}

impl DomainError for SettingsError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;
