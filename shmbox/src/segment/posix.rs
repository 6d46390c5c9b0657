use log::{debug, trace, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use super::Mapping;
use crate::errors::{IpcError, Result};
use crate::naming::SegmentId;

pub(crate) struct PosixMapping {
    shmem: Shmem,
    os_name: String,
    unlinked: bool,
}

impl PosixMapping {
    pub(crate) fn create(id: &SegmentId, size: usize) -> Result<PosixMapping> {
        let os_name = id.os_name();
        trace!("shm_open(O_CREAT|O_EXCL) {} for {} bytes", os_name, size);
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(&os_name)
            .create()
            .map_err(|e| IpcError::allocation(&os_name, e.into()))?;
        debug!("created {} ({} bytes mapped)", os_name, shmem.len());
        Ok(PosixMapping {
            shmem,
            os_name,
            unlinked: false,
        })
    }

    pub(crate) fn open(id: &SegmentId) -> Result<Option<PosixMapping>> {
        let os_name = id.os_name();
        match ShmemConf::new().os_id(&os_name).open() {
            Ok(mut shmem) => {
                // shared_memory only marks creators as owners; keep it that way
                // until the channel decides.
                shmem.set_owner(false);
                Ok(Some(PosixMapping {
                    shmem,
                    os_name,
                    unlinked: false,
                }))
            }
            Err(ShmemError::MapOpenFailed(code)) if code == libc::ENOENT as u32 => Ok(None),
            // The creator has the name but has not sized it yet.
            Err(ShmemError::MapSizeZero) => Ok(None),
            Err(ShmemError::MapOpenFailed(code)) if code == libc::EINVAL as u32 => Ok(None),
            Err(e) => Err(IpcError::allocation(&os_name, e.into())),
        }
    }
}

impl Mapping for PosixMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    fn len(&self) -> usize {
        self.shmem.len()
    }

    fn set_owner(&mut self, owner: bool) {
        self.shmem.set_owner(owner && !self.unlinked);
    }

    fn unlink(&mut self) -> Result<()> {
        if self.unlinked {
            return Ok(());
        }
        unlink_name(&self.os_name)?;
        self.unlinked = true;
        self.shmem.set_owner(false);
        Ok(())
    }
}

#[cfg(unix)]
fn unlink_name(os_name: &str) -> Result<()> {
    use std::ffi::CString;

    let c_name = CString::new(os_name).map_err(|_| IpcError::Native {
        status: crate::status::Status::from_errno(libc::EINVAL),
        message: format!("segment name {:?} contains a NUL byte", os_name),
    })?;
    trace!("shm_unlink {}", os_name);
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            warn!("{} was already unlinked by another process", os_name);
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn unlink_name(os_name: &str) -> Result<()> {
    // Named mappings vanish with their last handle; nothing to remove early.
    trace!("unlink {} is deferred to the last close", os_name);
    Ok(())
}
