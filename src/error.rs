//! Error types and Result aliases for the storage engine

use std::fmt;

/// Result codes surfaced by the B-tree layer and its page manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Internal invariant violated
    Internal = 2,
    /// Page manager reported a conflicting lock holder
    Busy = 5,
    /// Transient allocation failure
    NoMem = 7,
    /// Attempt to write through a read-only handle
    ReadOnly = 8,
    /// I/O failure in the underlying file
    IoErr = 10,
    /// Structural invariant violated on a page read
    Corrupt = 11,
    /// Storage cannot supply another page
    Full = 13,
    /// File could not be opened
    CantOpen = 14,
    /// File is not a database
    NotADb = 26,
    /// Caller misuse, such as an incompatible seek key
    Misuse = 21,
    /// Index argument out of range
    Range = 25,
}

impl ErrorCode {
    /// Short English description (sqlite3ErrStr)
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal logic error",
            ErrorCode::Busy => "database is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::NotADb => "file is not a database",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::Range => "column index out of range",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carrying a result code and an optional detail message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}{}", detail_suffix(.message))]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

fn detail_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Shorthand for a corruption report with detail.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Corrupt, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_corrupt(&self) -> bool {
        self.code == ErrorCode::Corrupt
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::OutOfMemory => ErrorCode::NoMem,
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorCode::CantOpen
            }
            _ => ErrorCode::IoErr,
        };
        Error::with_message(code, err.to_string())
    }
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_with_message() {
        let err = Error::with_message(ErrorCode::Corrupt, "bad cell pointer");
        assert_eq!(
            err.to_string(),
            "database disk image is malformed: bad cell pointer"
        );
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_error_display_code_only() {
        let err = Error::new(ErrorCode::Full);
        assert_eq!(err.to_string(), "database or disk is full");
        assert_eq!(err.message(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io.into();
        assert_eq!(err.code(), ErrorCode::IoErr);
    }
}
