//! Byte layout of a segment.
//!
//! ```text
//! +--------+-----------------+-------------+---------------------+
//! | Header | mailbox words   | lock region | payload (num_bytes) |
//! +--------+-----------------+-------------+---------------------+
//!                            ^ 64-aligned  ^ 64-aligned
//! ```
//!
//! Everything after the magic word is written before the magic is published,
//! so a reader that sees the magic with acquire ordering sees a complete
//! header.

use std::convert::TryFrom;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::{IpcError, Result};
use super::lock;

pub const HEADER_MAGIC: u64 = 0x5348_4d42_4f58_0a01;
pub const LAYOUT_VERSION: u32 = 1;

pub const FLAG_LOCKING: u32 = 0x1;

#[repr(C)]
pub struct Header {
    pub magic: AtomicU64,
    pub version: u32,
    pub flags: u32,
    pub total_size: u64,
    pub num_bytes: u64,
    pub payload_offset: u64,
    pub num_mailboxes: u64,
    pub lock_offset: u64,
}

pub const HEADER_LEN: usize = mem::size_of::<Header>();
pub const MAILBOX_WORD_LEN: usize = mem::size_of::<AtomicU64>();

#[inline]
pub fn align64(x: usize) -> Option<usize> {
    Some(x.checked_add(63)? & !63)
}

pub fn build_flags() -> u32 {
    if lock::LOCKING_ENABLED {
        FLAG_LOCKING
    } else {
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub num_bytes: usize,
    pub num_mailboxes: usize,
    pub lock_offset: usize,
    pub payload_offset: usize,
    pub total_size: usize,
}

impl Layout {
    /// `None` when the sections do not fit in the address space.
    pub fn compute(num_bytes: usize, num_mailboxes: usize) -> Option<Layout> {
        let mailbox_end = num_mailboxes
            .checked_mul(MAILBOX_WORD_LEN)?
            .checked_add(HEADER_LEN)?;
        let lock_offset = align64(mailbox_end)?;
        let payload_offset = align64(lock_offset.checked_add(lock::REGION_LEN)?)?;
        let total_size = align64(payload_offset.checked_add(num_bytes)?)?;
        Some(Layout {
            num_bytes,
            num_mailboxes,
            lock_offset,
            payload_offset,
            total_size,
        })
    }

    /// Reads and validates a published header found in a mapping of
    /// `mapped_len` bytes.
    pub fn read(header: &Header, mapped_len: usize) -> Result<Layout> {
        if header.version != LAYOUT_VERSION {
            return Err(IpcError::CorruptHeader(format!(
                "layout version {} is not supported (expected {})",
                header.version, LAYOUT_VERSION
            )));
        }
        if header.flags != build_flags() {
            return Err(IpcError::CorruptHeader(format!(
                "segment flags 0x{:x} do not match this build (0x{:x}); both sides must agree on locking",
                header.flags,
                build_flags()
            )));
        }
        let expected = usize::try_from(header.num_bytes)
            .ok()
            .zip(usize::try_from(header.num_mailboxes).ok())
            .and_then(|(num_bytes, num_mailboxes)| Layout::compute(num_bytes, num_mailboxes))
            .ok_or_else(|| {
                IpcError::CorruptHeader(format!(
                    "{} payload bytes and {} mailboxes do not fit in the address space",
                    header.num_bytes, header.num_mailboxes
                ))
            })?;
        if expected.payload_offset as u64 != header.payload_offset
            || expected.lock_offset as u64 != header.lock_offset
            || expected.total_size as u64 != header.total_size
        {
            return Err(IpcError::CorruptHeader(format!(
                "inconsistent offsets (payload {}, lock {}, total {})",
                header.payload_offset, header.lock_offset, header.total_size
            )));
        }
        if expected.total_size > mapped_len {
            return Err(IpcError::CorruptHeader(format!(
                "header claims {} bytes but only {} are mapped",
                expected.total_size, mapped_len
            )));
        }
        Ok(expected)
    }

    /// Writes everything but the magic word, which stays zero.
    ///
    /// # Safety
    /// `base` must point to at least `self.total_size` writable bytes.
    pub unsafe fn write_header(&self, base: *mut u8) {
        (base as *mut Header).write(Header {
            magic: AtomicU64::new(0),
            version: LAYOUT_VERSION,
            flags: build_flags(),
            total_size: self.total_size as u64,
            num_bytes: self.num_bytes as u64,
            payload_offset: self.payload_offset as u64,
            num_mailboxes: self.num_mailboxes as u64,
            lock_offset: self.lock_offset as u64,
        });
        let mailboxes = base.add(HEADER_LEN) as *mut AtomicU64;
        for i in 0..self.num_mailboxes {
            mailboxes.add(i).write(AtomicU64::new(0));
        }
    }
}

/// # Safety
/// `base` must point to a mapping of at least `HEADER_LEN` bytes.
pub unsafe fn header<'a>(base: *mut u8) -> &'a Header {
    &*(base as *const Header)
}

pub fn publish(header: &Header) {
    header.magic.store(HEADER_MAGIC, Ordering::Release);
}

pub fn is_published(header: &Header) -> bool {
    header.magic.load(Ordering::Acquire) == HEADER_MAGIC
}

pub fn retract(header: &Header) {
    header.magic.store(0, Ordering::Release);
}
