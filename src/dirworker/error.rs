use crate::errors::{DomainError, ErrorCode};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirWorkerErrorCode {
    WatcherCreate,
    WatchPath,
    DirectoryUnreadable,
    DirectoryMissing,
}

impl ErrorCode for DirWorkerErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::WatcherCreate => "watcher_create_failed",
            Self::WatchPath => "watch_path_failed",
            Self::DirectoryUnreadable => "directory_unreadable",
            Self::DirectoryMissing => "directory_missing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirWorkerError {
    code: DirWorkerErrorCode,
    message: String,
}

impl DirWorkerError {
    pub fn new(code: DirWorkerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> DirWorkerErrorCode {
        self.code
    }
}

impl fmt::Display for DirWorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DirWorkerError {}

impl DomainError for DirWorkerError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

pub type DirWorkerResult<T> = Result<T, DirWorkerError>;
