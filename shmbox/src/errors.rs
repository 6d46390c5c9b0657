use std::io;

use shared_memory::ShmemError;
use thiserror::Error;

use super::status::{ErrorCode, Status};

/// Misuse of a channel handle. Always raised at the point of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("the shared memory segment is not open; create or open it first")]
    NotOpen,
    #[error("the shared memory segment is already open")]
    AlreadyOpen,
    #[error("the channel handle has already been closed")]
    AlreadyClosed,
    #[error("null native handle")]
    NullHandle,
    #[error("the lock is not held by this handle")]
    NotLocked,
    #[error("the {0} implementation requires the creator to also be the owner")]
    CreatorMustBeOwner(&'static str),
    #[error("invalid state")]
    InvalidState,
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::NotOpen => ErrorCode::NotOpen,
            StateError::AlreadyOpen => ErrorCode::AlreadyOpen,
            StateError::AlreadyClosed => ErrorCode::AlreadyClosed,
            StateError::NullHandle => ErrorCode::NullRef,
            StateError::NotLocked => ErrorCode::NotLocked,
            StateError::CreatorMustBeOwner(_) => ErrorCode::CreatorMustBeOwner,
            StateError::InvalidState => ErrorCode::InvalidState,
        }
    }
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to allocate shared memory segment \"{name}\": {reason}")]
    Allocation {
        name: String,
        status: Status,
        reason: String,
    },
    #[error("range of {length} bytes at offset {offset} exceeds the {size} byte segment")]
    Bounds {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("operation would block")]
    WouldBlock,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("there are only {count} mailboxes, mailbox {mailbox} was referenced")]
    InvalidMailbox { mailbox: usize, count: usize },
    #[error("corrupt shared memory header: {0}")]
    CorruptHeader(String),
    #[error("{status}")]
    Native { status: Status, message: String },
}

impl IpcError {
    /// The numeric status handed across the native boundary for this error.
    pub fn status(&self) -> Status {
        match self {
            IpcError::Allocation { status, .. } => *status,
            IpcError::Bounds { .. } => Status::from_code(ErrorCode::OutOfBounds),
            IpcError::WouldBlock => Status::WOULD_BLOCK,
            IpcError::State(e) => Status::from_code(e.code()),
            IpcError::InvalidMailbox { .. } => Status::from_errno(libc::EINVAL),
            IpcError::CorruptHeader(_) => Status::from_code(ErrorCode::CorruptHeader),
            IpcError::Native { status, .. } => *status,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, IpcError::WouldBlock)
    }

    pub fn from_status(status: Status) -> IpcError {
        if status.is_would_block() {
            return IpcError::WouldBlock;
        }
        match status.library_code() {
            Some(ErrorCode::NotOpen) => StateError::NotOpen.into(),
            Some(ErrorCode::AlreadyOpen) => StateError::AlreadyOpen.into(),
            Some(ErrorCode::AlreadyClosed) => StateError::AlreadyClosed.into(),
            Some(ErrorCode::NullRef) => StateError::NullHandle.into(),
            Some(ErrorCode::NotLocked) => StateError::NotLocked.into(),
            Some(ErrorCode::InvalidState) => StateError::InvalidState.into(),
            Some(ErrorCode::CorruptHeader) => IpcError::CorruptHeader(status.message()),
            _ => IpcError::Native {
                status,
                message: status.message(),
            },
        }
    }

    pub(crate) fn last_os_error() -> IpcError {
        io::Error::last_os_error().into()
    }

    // raw_sync reports every failure as a boxed error without a code.
    #[cfg(feature = "locking")]
    pub(crate) fn lock<E: std::fmt::Display>(err: E) -> IpcError {
        IpcError::Native {
            status: Status::from_code(ErrorCode::InvalidState),
            message: format!("lock error: {}", err),
        }
    }

    pub(crate) fn allocation(name: &str, err: IpcError) -> IpcError {
        match err {
            IpcError::Native { status, message } => IpcError::Allocation {
                name: name.to_string(),
                status,
                reason: message,
            },
            other => other,
        }
    }
}

pub(crate) fn shmem_status(err: &ShmemError) -> Status {
    match err {
        ShmemError::MapCreateFailed(code)
        | ShmemError::MapOpenFailed(code)
        | ShmemError::UnknownOsError(code) => Status::from_errno(*code as i32),
        ShmemError::MappingIdExists | ShmemError::LinkExists => Status::from_errno(libc::EEXIST),
        ShmemError::LinkDoesNotExist => Status::from_errno(libc::ENOENT),
        ShmemError::MapSizeZero => Status::from_errno(libc::EINVAL),
        _ => Status::from_code(ErrorCode::InvalidState),
    }
}

impl From<ShmemError> for IpcError {
    fn from(err: ShmemError) -> Self {
        IpcError::Native {
            status: shmem_status(&err),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        let status = err
            .raw_os_error()
            .map(Status::from_errno)
            .unwrap_or_else(|| Status::from_code(ErrorCode::InvalidState));
        IpcError::Native {
            status,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_round_trip_through_status() {
        for state in [
            StateError::NotOpen,
            StateError::AlreadyOpen,
            StateError::AlreadyClosed,
            StateError::NullHandle,
            StateError::NotLocked,
        ] {
            let err: IpcError = state.into();
            match IpcError::from_status(err.status()) {
                IpcError::State(back) => assert_eq!(back, state),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn bounds_and_mailbox_map_to_codes() {
        let err = IpcError::Bounds {
            offset: 10,
            length: 10,
            size: 15,
        };
        assert_eq!(err.status().library_code(), Some(ErrorCode::OutOfBounds));

        let err = IpcError::InvalidMailbox { mailbox: 2, count: 1 };
        assert_eq!(err.status().errno(), Some(libc::EINVAL));
    }

    #[test]
    fn allocation_keeps_native_status() {
        let native: IpcError = io::Error::from_raw_os_error(libc::EACCES).into();
        let err = IpcError::allocation("/seg", native);
        match &err {
            IpcError::Allocation { name, status, .. } => {
                assert_eq!(name, "/seg");
                assert_eq!(status.errno(), Some(libc::EACCES));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn shmem_errors_carry_errno() {
        let err: IpcError = ShmemError::MapOpenFailed(libc::EACCES as u32).into();
        assert_eq!(err.status().errno(), Some(libc::EACCES));
        let err: IpcError = ShmemError::MappingIdExists.into();
        assert_eq!(err.status().errno(), Some(libc::EEXIST));
    }
}
