//! Process-shared lock living in the segment header.
//!
//! Built without the `locking` feature every acquisition succeeds at once and
//! release does nothing. Callers must not rely on exclusion in that mode.

/// Try once without waiting.
pub const TRY_LOCK: i64 = 0;
/// Wait as long as it takes.
pub const INFINITE: i64 = -1;

pub const LOCKING_ENABLED: bool = cfg!(feature = "locking");

#[cfg(feature = "locking")]
pub const REGION_LEN: usize = 256;
#[cfg(not(feature = "locking"))]
pub const REGION_LEN: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockTimeout {
    TryOnce,
    Infinite,
    Millis(u64),
}

impl LockTimeout {
    pub fn from_millis(millis: i64) -> LockTimeout {
        if millis == 0 {
            LockTimeout::TryOnce
        } else if millis < 0 {
            LockTimeout::Infinite
        } else {
            LockTimeout::Millis(millis as u64)
        }
    }
}

#[cfg(feature = "locking")]
mod imp {
    use std::mem;
    use std::time::Duration;

    use log::trace;
    use raw_sync::locks::{LockImpl, LockInit, Mutex};
    use raw_sync::Timeout;

    use super::{LockTimeout, REGION_LEN};
    use crate::errors::{IpcError, Result};

    pub struct SegmentLock {
        inner: Box<dyn LockImpl>,
    }

    impl SegmentLock {
        /// # Safety
        /// `region` must point to `REGION_LEN` bytes inside the mapping that
        /// nothing else uses, `data` to the payload.
        pub unsafe fn init(region: *mut u8, data: *mut u8) -> Result<SegmentLock> {
            let (inner, used) = Mutex::new(region, data).map_err(IpcError::lock)?;
            if used > REGION_LEN {
                return Err(IpcError::CorruptHeader(format!(
                    "the mutex needs {} bytes but only {} are reserved",
                    used, REGION_LEN
                )));
            }
            Ok(SegmentLock { inner })
        }

        /// # Safety
        /// `region` must hold a mutex set up by [`SegmentLock::init`].
        pub unsafe fn attach(region: *mut u8, data: *mut u8) -> Result<SegmentLock> {
            let (inner, _) = Mutex::from_existing(region, data).map_err(IpcError::lock)?;
            Ok(SegmentLock { inner })
        }

        pub fn acquire(&self, timeout: LockTimeout) -> Result<bool> {
            let attempt = match timeout {
                LockTimeout::Infinite => self.inner.lock(),
                LockTimeout::TryOnce => self.inner.try_lock(Timeout::Val(Duration::from_millis(0))),
                LockTimeout::Millis(ms) => self.inner.try_lock(Timeout::Val(Duration::from_millis(ms))),
            };
            match attempt {
                Ok(guard) => {
                    // Released explicitly through `release`.
                    mem::forget(guard);
                    Ok(true)
                }
                Err(e) if timeout != LockTimeout::Infinite => {
                    trace!("lock not acquired within {:?}: {}", timeout, e);
                    Ok(false)
                }
                Err(e) => Err(IpcError::lock(e)),
            }
        }

        pub fn release(&self) -> Result<()> {
            self.inner.release().map_err(IpcError::lock)
        }
    }
}

#[cfg(not(feature = "locking"))]
mod imp {
    use super::LockTimeout;
    use crate::errors::Result;

    pub struct SegmentLock;

    impl SegmentLock {
        pub unsafe fn init(_region: *mut u8, _data: *mut u8) -> Result<SegmentLock> {
            Ok(SegmentLock)
        }

        pub unsafe fn attach(_region: *mut u8, _data: *mut u8) -> Result<SegmentLock> {
            Ok(SegmentLock)
        }

        pub fn acquire(&self, _timeout: LockTimeout) -> Result<bool> {
            Ok(true)
        }

        pub fn release(&self) -> Result<()> {
            Ok(())
        }
    }
}

pub(crate) use imp::SegmentLock;

pub fn is_locking_enabled() -> bool {
    LOCKING_ENABLED
}
