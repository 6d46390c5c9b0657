use std::fmt;
use std::io;

use super::errors::IpcError;

/// Library specific failures. When the upper 32 bits of a [`Status`] hold
/// `1`, the lower 32 bits are one of these. Otherwise the status is a plain
/// OS errno.
///
/// The discriminants are part of the wire contract with the Java binding so
/// they must never be reordered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    InvalidState = 1,
    NullRef = 2,
    NotOpen = 3,
    CreatorMustBeOwner = 4,
    AlreadyOpen = 5,
    AlreadyClosed = 6,
    OutOfBounds = 7,
    CorruptHeader = 8,
    NotLocked = 9,
}

impl ErrorCode {
    const ALL: [ErrorCode; 10] = [
        ErrorCode::Ok,
        ErrorCode::InvalidState,
        ErrorCode::NullRef,
        ErrorCode::NotOpen,
        ErrorCode::CreatorMustBeOwner,
        ErrorCode::AlreadyOpen,
        ErrorCode::AlreadyClosed,
        ErrorCode::OutOfBounds,
        ErrorCode::CorruptHeader,
        ErrorCode::NotLocked,
    ];

    pub fn from_u32(code: u32) -> Option<ErrorCode> {
        ErrorCode::ALL.get(code as usize).copied()
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::InvalidState => "Invalid State",
            ErrorCode::NullRef => "Null reference passed.",
            ErrorCode::NotOpen => "Shared memory is not opened. You need to create or open it first.",
            ErrorCode::CreatorMustBeOwner => {
                "This implementation of shared memory requires the creator to be the owner"
            }
            ErrorCode::AlreadyOpen => "The shared memory is already open.",
            ErrorCode::AlreadyClosed => "The shared memory handle has already been closed.",
            ErrorCode::OutOfBounds => "The requested range exceeds the shared memory segment.",
            ErrorCode::CorruptHeader => "The shared memory segment header is corrupt or incompatible.",
            ErrorCode::NotLocked => "The lock is not held by this handle.",
        }
    }
}

/// Numeric outcome of a channel operation as seen across the native boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u64);

const LIBRARY_MASK: u64 = 0xffff_ffff_0000_0000;
const LIBRARY_TAG: u64 = 0x0000_0001_0000_0000;

impl Status {
    pub const OK: Status = Status(0);
    pub const WOULD_BLOCK: Status = Status(libc::EAGAIN as u64);

    pub const fn from_raw(raw: u64) -> Status {
        Status(raw)
    }

    pub const fn from_errno(errno: i32) -> Status {
        Status(errno as u32 as u64)
    }

    pub const fn from_code(code: ErrorCode) -> Status {
        match code {
            ErrorCode::Ok => Status::OK,
            _ => Status(LIBRARY_TAG | code as u64),
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    pub fn is_would_block(self) -> bool {
        self == Status::WOULD_BLOCK
    }

    /// True for codes in the library range, false for OS errnos.
    pub fn is_library(self) -> bool {
        self.0 & LIBRARY_MASK != 0
    }

    pub fn library_code(self) -> Option<ErrorCode> {
        if self.0 & LIBRARY_MASK == LIBRARY_TAG {
            ErrorCode::from_u32((self.0 & !LIBRARY_MASK) as u32)
        } else {
            None
        }
    }

    pub fn errno(self) -> Option<i32> {
        if self.is_library() || self.is_ok() {
            None
        } else {
            Some(self.0 as i32)
        }
    }

    pub fn message(self) -> String {
        if self.is_ok() {
            return ErrorCode::Ok.description().to_string();
        }
        match (self.library_code(), self.errno()) {
            (Some(code), _) => code.description().to_string(),
            (None, Some(errno)) => io::Error::from_raw_os_error(errno).to_string(),
            (None, None) => "Unknown Error Code".to_string(),
        }
    }

    /// Turns a non-OK status into an error. `WOULD_BLOCK` passes through
    /// untouched unless `throw_on_would_block` is set.
    pub fn check(self, throw_on_would_block: bool) -> Result<Status, IpcError> {
        if self.is_ok() || (self.is_would_block() && !throw_on_would_block) {
            Ok(self)
        } else {
            Err(IpcError::from_status(self))
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status(0x{:016x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error(0x{:016x}): {}", self.0, self.message())
    }
}

impl From<ErrorCode> for Status {
    fn from(code: ErrorCode) -> Self {
        Status::from_code(code)
    }
}
