//! Status codes and the library error type.
//!
//! [`Status`] is the one-byte code transmitted on the wire; [`MapperError`]
//! is what fallible operations return inside the process. Every error maps
//! to exactly one status so the server loop can answer any failure with a
//! status-bearing frame.

use thiserror::Error;

/// Wire status codes.
///
/// Values are fixed by the protocol; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,

    // Client errors
    NotFound = 0x01,
    InvalidRequest = 0x02,
    InvalidMode = 0x03,
    UriTooLong = 0x04,
    UnsupportedOp = 0x05,

    // Server errors
    InternalError = 0x10,
    StorageError = 0x11,
    OutOfMemory = 0x12,
    Timeout = 0x13,
    Unavailable = 0x14,

    // Protocol errors
    ProtocolError = 0x20,
    VersionMismatch = 0x21,
    CapabilityError = 0x22,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Status> {
        Some(match value {
            0x00 => Status::Ok,
            0x01 => Status::NotFound,
            0x02 => Status::InvalidRequest,
            0x03 => Status::InvalidMode,
            0x04 => Status::UriTooLong,
            0x05 => Status::UnsupportedOp,
            0x10 => Status::InternalError,
            0x11 => Status::StorageError,
            0x12 => Status::OutOfMemory,
            0x13 => Status::Timeout,
            0x14 => Status::Unavailable,
            0x20 => Status::ProtocolError,
            0x21 => Status::VersionMismatch,
            0x22 => Status::CapabilityError,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOT_FOUND",
            Status::InvalidRequest => "INVALID_REQUEST",
            Status::InvalidMode => "INVALID_MODE",
            Status::UriTooLong => "URI_TOO_LONG",
            Status::UnsupportedOp => "UNSUPPORTED_OP",
            Status::InternalError => "INTERNAL_ERROR",
            Status::StorageError => "STORAGE_ERROR",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::Timeout => "TIMEOUT",
            Status::Unavailable => "UNAVAILABLE",
            Status::ProtocolError => "PROTOCOL_ERROR",
            Status::VersionMismatch => "VERSION_MISMATCH",
            Status::CapabilityError => "CAPABILITY_ERROR",
        }
    }

    /// True for every non-OK code.
    pub fn is_error(self) -> bool {
        self != Status::Ok
    }
}

/// Errors surfaced by the core.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("object not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid mode {0:#04x}")]
    InvalidMode(u8),

    #[error("URI too long ({0} bytes)")]
    UriTooLong(usize),

    #[error("unsupported operation: {0}")]
    UnsupportedOp(&'static str),

    #[error("duplicate object in index")]
    Duplicate,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("version mismatch (peer sent {0:#04x})")]
    VersionMismatch(u8),

    #[error("capability error: {0}")]
    Capability(String),

    /// A non-OK status carried back through the client library.
    #[error("server returned {}", .0.name())]
    Remote(Status),
}

impl MapperError {
    /// The wire status this error maps to.
    pub fn status(&self) -> Status {
        match self {
            MapperError::NotFound => Status::NotFound,
            MapperError::InvalidRequest(_) => Status::InvalidRequest,
            MapperError::InvalidMode(_) => Status::InvalidMode,
            MapperError::UriTooLong(_) => Status::UriTooLong,
            MapperError::UnsupportedOp(_) => Status::UnsupportedOp,
            MapperError::Duplicate => Status::InternalError,
            MapperError::Unavailable(_) => Status::Unavailable,
            MapperError::Storage(_) | MapperError::Io(_) => Status::StorageError,
            MapperError::Protocol(_) => Status::ProtocolError,
            MapperError::VersionMismatch(_) => Status::VersionMismatch,
            MapperError::Capability(_) => Status::CapabilityError,
            MapperError::Remote(status) => *status,
        }
    }
}

impl From<nix::Error> for MapperError {
    fn from(err: nix::Error) -> Self {
        MapperError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

pub type Result<T> = std::result::Result<T, MapperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for code in [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x10, 0x11, 0x12, 0x13, 0x14, 0x20, 0x21, 0x22] {
            let status = Status::from_u8(code).unwrap();
            assert_eq!(status as u8, code);
        }
        assert!(Status::from_u8(0x42).is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(MapperError::NotFound.status(), Status::NotFound);
        assert_eq!(MapperError::Duplicate.status(), Status::InternalError);
        assert_eq!(
            MapperError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)).status(),
            Status::StorageError
        );
        assert_eq!(MapperError::Remote(Status::Timeout).status(), Status::Timeout);
    }
}
