use std::io::ErrorKind;

pub trait ErrorCode {
    #[allow(clippy::wrong_self_convention)]
    fn as_code_str(self) -> &'static str;
}

pub trait DomainError: std::error::Error {
    fn code_str(&self) -> &'static str;
    fn message(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorHint {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidInput,
    ReadOnlyFilesystem,
    Other,
}

pub fn classify_io_error(error: &std::io::Error) -> IoErrorHint {
    let from_kind = match error.kind() {
        ErrorKind::NotFound => IoErrorHint::NotFound,
        ErrorKind::PermissionDenied => IoErrorHint::PermissionDenied,
        ErrorKind::AlreadyExists => IoErrorHint::AlreadyExists,
        ErrorKind::InvalidInput => IoErrorHint::InvalidInput,
        _ => IoErrorHint::Other,
    };
    if from_kind != IoErrorHint::Other {
        return from_kind;
    }
    error
        .raw_os_error()
        .map(classify_raw_os_error)
        .unwrap_or(IoErrorHint::Other)
}

pub fn classify_raw_os_error(raw: i32) -> IoErrorHint {
    #[cfg(windows)]
    {
        return match raw {
            5 => IoErrorHint::PermissionDenied,     // ERROR_ACCESS_DENIED
            2 | 3 => IoErrorHint::NotFound,         // ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND
            80 | 183 => IoErrorHint::AlreadyExists, // ERROR_FILE_EXISTS | ERROR_ALREADY_EXISTS
            19 => IoErrorHint::ReadOnlyFilesystem,  // ERROR_WRITE_PROTECT
            87 => IoErrorHint::InvalidInput,        // ERROR_INVALID_PARAMETER
            _ => IoErrorHint::Other,
        };
    }

    #[cfg(unix)]
    {
        return match raw {
            1 | 13 => IoErrorHint::PermissionDenied, // EPERM | EACCES
            2 => IoErrorHint::NotFound,              // ENOENT
            17 => IoErrorHint::AlreadyExists,        // EEXIST
            22 => IoErrorHint::InvalidInput,         // EINVAL
            30 => IoErrorHint::ReadOnlyFilesystem,   // EROFS
            _ => IoErrorHint::Other,
        };
    }

    #[allow(unreachable_code)]
    IoErrorHint::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        let err = std::io::Error::from(ErrorKind::NotFound);
        assert_eq!(classify_io_error(&err), IoErrorHint::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn classifies_raw_unix_codes() {
        assert_eq!(classify_raw_os_error(13), IoErrorHint::PermissionDenied);
        assert_eq!(classify_raw_os_error(30), IoErrorHint::ReadOnlyFilesystem);
        assert_eq!(classify_raw_os_error(999), IoErrorHint::Other);
    }
}
