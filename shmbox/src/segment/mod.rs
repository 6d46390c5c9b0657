//! OS shared memory objects. The channel only sees a [`Mapping`]; which OS
//! facility backs it is picked by [`Backend`].

use serde_derive::{Deserialize, Serialize};

use super::errors::Result;
use super::naming::SegmentId;

mod posix;
#[cfg(unix)]
mod sysv;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Named objects (`shm_open`), keyed by [`SegmentId::name`].
    Posix,
    /// Integer keyed segments (`shmget`), keyed by [`SegmentId::key`].
    SystemV,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Posix
    }
}

impl Backend {
    pub fn implementation_name(self) -> &'static str {
        match self {
            Backend::Posix => "Posix",
            Backend::SystemV => "SystemV",
        }
    }

    /// System V segments are only ever destroyed by the creator.
    pub fn requires_creator_to_be_owner(self) -> bool {
        matches!(self, Backend::SystemV)
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Backend> {
        match ordinal {
            0 => Some(Backend::Posix),
            1 => Some(Backend::SystemV),
            _ => None,
        }
    }
}

pub(crate) trait Mapping {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn set_owner(&mut self, owner: bool);

    /// Removes the OS visible identity. Calling it again is a no-op and the
    /// mapping itself stays valid.
    fn unlink(&mut self) -> Result<()>;
}

pub(crate) fn create(backend: Backend, id: &SegmentId, size: usize) -> Result<Box<dyn Mapping>> {
    match backend {
        Backend::Posix => Ok(Box::new(posix::PosixMapping::create(id, size)?)),
        #[cfg(unix)]
        Backend::SystemV => Ok(Box::new(sysv::SysVMapping::create(id, size)?)),
        #[cfg(not(unix))]
        Backend::SystemV => Err(unsupported()),
    }
}

/// `Ok(None)` means nothing by that name/key exists yet.
pub(crate) fn open(backend: Backend, id: &SegmentId) -> Result<Option<Box<dyn Mapping>>> {
    match backend {
        Backend::Posix => Ok(posix::PosixMapping::open(id)?.map(|m| Box::new(m) as Box<dyn Mapping>)),
        #[cfg(unix)]
        Backend::SystemV => Ok(sysv::SysVMapping::open(id)?.map(|m| Box::new(m) as Box<dyn Mapping>)),
        #[cfg(not(unix))]
        Backend::SystemV => Err(unsupported()),
    }
}

#[cfg(not(unix))]
fn unsupported() -> super::errors::IpcError {
    super::errors::IpcError::Native {
        status: super::status::Status::from_code(super::status::ErrorCode::InvalidState),
        message: "System V shared memory is not available on this platform".to_string(),
    }
}
