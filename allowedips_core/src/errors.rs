//! Error handling and C-ABI error codes for the allowed-IP table

use std::cell::RefCell;
use std::os::raw::c_char;
use thiserror::Error;

/// Errors returned by mutating table operations.
///
/// A lookup that finds no route is `None`, never an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid cidr /{cidr}: family allows at most /{max}")]
    InvalidCidr { cidr: u8, max: u8 },

    #[error("address must be 4 or 16 bytes, got {0}")]
    InvalidAddressLength(usize),

    #[error("out of memory: insert needs {needed} node(s), {available} available")]
    OutOfMemory { needed: usize, available: usize },
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidCidr = 1,
    OutOfMemory = 2,
    InvalidAddress = 3,
    InvalidHandle = 4,
    Utf8Error = 5,
    ParseError = 6,
    NotFound = 7,
    Unknown = 255,
}

impl ErrorCode {
    /// NUL-terminated description, suitable for handing across the C ABI.
    pub fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::InvalidCidr => b"Invalid CIDR length\0",
            ErrorCode::OutOfMemory => b"Out of memory\0",
            ErrorCode::InvalidAddress => b"Invalid address\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::ParseError => b"Could not parse address or CIDR\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }

    pub fn as_str(self) -> &'static str {
        let bytes = self.as_cstr();
        // every literal above is ASCII
        std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap_or("Unknown error")
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidCidr { .. } => ErrorCode::InvalidCidr,
            Error::InvalidAddressLength(_) => ErrorCode::InvalidAddress,
            Error::OutOfMemory { .. } => ErrorCode::OutOfMemory,
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

/// Record `code` as this thread's last error and hand it back.
#[inline]
pub fn record(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[no_mangle]
pub extern "C" fn allowedips_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn allowedips_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_and_describe() {
        let e = Error::InvalidCidr { cidr: 33, max: 32 };
        assert_eq!(ErrorCode::from(&e), ErrorCode::InvalidCidr);
        assert_eq!(e.to_string(), "invalid cidr /33: family allows at most /32");
        assert_eq!(ErrorCode::NotFound.as_str(), "Not found");
        assert!(ErrorCode::OutOfMemory.as_cstr().ends_with(b"\0"));
    }

    #[test]
    fn last_error_is_thread_local() {
        record(ErrorCode::ParseError);
        assert_eq!(get_last_error(), ErrorCode::ParseError);
        std::thread::spawn(|| assert_eq!(get_last_error(), ErrorCode::Success))
            .join()
            .unwrap();
    }
}
