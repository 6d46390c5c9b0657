use log::warn;

use super::ShmChannel;
use crate::errors::Result;

/// Holds the channel lock until dropped or [`unlock`](LockGuard::unlock)ed.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    channel: &'a ShmChannel,
    armed: bool,
}

impl<'a> LockGuard<'a> {
    pub(super) fn new(channel: &'a ShmChannel) -> LockGuard<'a> {
        LockGuard {
            channel,
            armed: true,
        }
    }

    pub fn channel(&self) -> &ShmChannel {
        self.channel
    }

    /// Releases early and reports a failed release instead of logging it.
    pub fn unlock(mut self) -> Result<()> {
        self.armed = false;
        self.channel.unlock()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.channel.unlock() {
                warn!("failed to release the lock on {}: {}", self.channel.id(), e);
            }
        }
    }
}
