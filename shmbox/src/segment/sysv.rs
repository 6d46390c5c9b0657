use std::mem;
use std::ptr;

use libc::{c_int, c_void};
use log::{debug, trace, warn};

use super::Mapping;
use crate::errors::{IpcError, Result};
use crate::naming::SegmentId;

const PERMISSIONS: c_int = 0o666;

pub(crate) struct SysVMapping {
    shmid: c_int,
    key: i32,
    addr: *mut u8,
    len: usize,
    owner: bool,
    removed: bool,
}

fn attach(shmid: c_int) -> Result<*mut u8> {
    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(IpcError::last_os_error());
    }
    Ok(addr as *mut u8)
}

fn segment_size(shmid: c_int) -> Result<usize> {
    let mut stat: libc::shmid_ds = unsafe { mem::zeroed() };
    if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut stat) } == -1 {
        return Err(IpcError::last_os_error());
    }
    Ok(stat.shm_segsz as usize)
}

fn remove(shmid: c_int) -> Result<()> {
    if unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::EIDRM) => Ok(()),
            _ => Err(err.into()),
        }
    } else {
        Ok(())
    }
}

impl SysVMapping {
    pub(crate) fn create(id: &SegmentId, size: usize) -> Result<SysVMapping> {
        let label = format!("0x{:08x}", id.key);
        trace!("shmget(IPC_CREAT|IPC_EXCL) key {} for {} bytes", label, size);
        let shmid = unsafe {
            libc::shmget(
                id.key as libc::key_t,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | PERMISSIONS,
            )
        };
        if shmid < 0 {
            return Err(IpcError::allocation(&label, IpcError::last_os_error()));
        }
        let addr = match attach(shmid) {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(cleanup) = remove(shmid) {
                    warn!("failed to remove half created segment {}: {}", label, cleanup);
                }
                return Err(IpcError::allocation(&label, e));
            }
        };
        debug!("created System V segment {} (shmid {})", label, shmid);
        Ok(SysVMapping {
            shmid,
            key: id.key,
            addr,
            len: size,
            owner: true,
            removed: false,
        })
    }

    pub(crate) fn open(id: &SegmentId) -> Result<Option<SysVMapping>> {
        let label = format!("0x{:08x}", id.key);
        let shmid = unsafe { libc::shmget(id.key as libc::key_t, 0, PERMISSIONS) };
        if shmid < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(IpcError::allocation(&label, err.into()));
        }
        let len = segment_size(shmid).map_err(|e| IpcError::allocation(&label, e))?;
        let addr = attach(shmid).map_err(|e| IpcError::allocation(&label, e))?;
        trace!("attached System V segment {} of {} bytes", label, len);
        Ok(Some(SysVMapping {
            shmid,
            key: id.key,
            addr,
            len,
            owner: false,
            removed: false,
        }))
    }
}

impl Mapping for SysVMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn set_owner(&mut self, owner: bool) {
        self.owner = owner;
    }

    fn unlink(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        // The segment lives on until its last detach but the key is released.
        remove(self.shmid)?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for SysVMapping {
    fn drop(&mut self) {
        if unsafe { libc::shmdt(self.addr as *const c_void) } == -1 {
            warn!(
                "failed to detach System V segment 0x{:08x}: {}",
                self.key,
                std::io::Error::last_os_error()
            );
        }
        if self.owner && !self.removed {
            if let Err(e) = remove(self.shmid) {
                warn!("failed to remove System V segment 0x{:08x}: {}", self.key, e);
            }
        }
    }
}
