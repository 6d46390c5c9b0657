use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::errors::{IpcError, Result, StateError};
use super::image::{CloseAction, ElementType, ImageShape, ImageView};
use super::layout::{self, Header, Layout, HEADER_LEN};
use super::lock::{LockTimeout, SegmentLock, LOCKING_ENABLED, TRY_LOCK};
use super::naming::SegmentId;
use super::segment::{self, Backend, Mapping};
use super::status::Status;
use super::wait::{self, WaitStrategy};

mod guard;

pub use guard::LockGuard;

const EMPTY: u64 = 0;
const POSTED: u64 = 1;

/// How long `open` waits for a creator that has the OS object but has not
/// published the header yet.
const OPEN_GRACE: Duration = Duration::from_millis(500);

struct Attached {
    mapping: Box<dyn Mapping>,
    layout: Layout,
    lock: SegmentLock,
    owner: bool,
    unlinked: bool,
    lock_held: Cell<bool>,
}

impl Attached {
    #[inline]
    fn base(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { layout::header(self.base()) }
    }

    #[inline]
    fn payload(&self) -> *mut u8 {
        unsafe { self.base().add(self.layout.payload_offset) }
    }

    #[inline]
    fn mailbox(&self, mailbox: usize) -> Result<&AtomicU64> {
        if mailbox >= self.layout.num_mailboxes {
            return Err(IpcError::InvalidMailbox {
                mailbox,
                count: self.layout.num_mailboxes,
            });
        }
        unsafe {
            let words = self.base().add(HEADER_LEN) as *const AtomicU64;
            Ok(&*words.add(mailbox))
        }
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<()> {
        let size = self.layout.num_bytes;
        match offset.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(IpcError::Bounds {
                offset,
                length,
                size,
            }),
        }
    }

    fn detach(self, id: &SegmentId) {
        if self.lock_held.get() {
            if let Err(e) = self.lock.release() {
                warn!("failed to release the lock on {} while closing: {}", id, e);
            }
        }
        if self.owner && !self.unlinked {
            // Openers racing with the teardown must not trust what is left.
            layout::retract(self.header());
        }
        debug!("closing {} (owner: {})", id, self.owner);
        drop(self.mapping);
    }
}

enum State {
    Detached,
    Open(Attached),
    Closed,
}

/// One process' handle on a shared memory segment carrying a payload and a
/// small set of mailboxes.
///
/// Designed for exactly one writer and one reader per mailbox. Use two
/// mailboxes for request/response. A handle is bound to the thread that uses
/// it; every participant, thread or process, attaches its own handle to the
/// segment.
///
/// With the `locking` feature the payload is guarded by a process-shared
/// lock. The lock is advisory: nothing stops a participant from touching the
/// payload without it. Without the feature, [`lock`](Self::lock) always
/// succeeds and there is no exclusion and no visibility guarantee beyond the
/// ordering of the mailbox flags.
pub struct ShmChannel {
    id: SegmentId,
    backend: Backend,
    state: State,
}

impl ShmChannel {
    /// A handle on `name`, with the System V key derived from the name.
    pub fn new(name: &str) -> ShmChannel {
        ShmChannel::with_id(SegmentId::new(name), Backend::default())
    }

    pub fn with_id(id: SegmentId, backend: Backend) -> ShmChannel {
        ShmChannel {
            id,
            backend,
            state: State::Detached,
        }
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn key(&self) -> i32 {
        self.id.key
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn implementation_name(&self) -> &'static str {
        self.backend.implementation_name()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn is_owner(&self) -> bool {
        match &self.state {
            State::Open(a) => a.owner && !a.unlinked,
            _ => false,
        }
    }

    fn attached(&self) -> Result<&Attached> {
        match &self.state {
            State::Open(a) => Ok(a),
            State::Detached => Err(StateError::NotOpen.into()),
            State::Closed => Err(StateError::AlreadyClosed.into()),
        }
    }

    fn attached_mut(&mut self) -> Result<&mut Attached> {
        match &mut self.state {
            State::Open(a) => Ok(a),
            State::Detached => Err(StateError::NotOpen.into()),
            State::Closed => Err(StateError::AlreadyClosed.into()),
        }
    }

    fn ensure_detached(&self) -> Result<()> {
        match self.state {
            State::Detached => Ok(()),
            State::Open(_) => Err(StateError::AlreadyOpen.into()),
            State::Closed => Err(StateError::AlreadyClosed.into()),
        }
    }

    /// Creates the segment with `size` payload bytes and `mailboxes` mailboxes
    /// (1 for simplex, 2 for duplex). An `owner` destroys the OS object when
    /// it closes.
    pub fn create(&mut self, size: usize, owner: bool, mailboxes: usize) -> Result<()> {
        self.ensure_detached()?;
        if size == 0 || mailboxes == 0 {
            return Err(IpcError::Allocation {
                name: self.id.name.clone(),
                status: Status::from_errno(libc::EINVAL),
                reason: format!(
                    "a segment needs at least one payload byte and one mailbox (got {} bytes, {} mailboxes)",
                    size, mailboxes
                ),
            });
        }
        if !owner && self.backend.requires_creator_to_be_owner() {
            return Err(StateError::CreatorMustBeOwner(self.backend.implementation_name()).into());
        }

        let layout = Layout::compute(size, mailboxes).ok_or_else(|| IpcError::Allocation {
            name: self.id.name.clone(),
            status: Status::from_errno(libc::ENOMEM),
            reason: format!("{} bytes and {} mailboxes do not fit in the address space", size, mailboxes),
        })?;
        debug!(
            "creating {} with {} payload bytes, {} mailboxes, {} bytes total (owner: {})",
            self.id, size, mailboxes, layout.total_size, owner
        );
        // Owned until fully set up so a failure below removes the object.
        let mut mapping = segment::create(self.backend, &self.id, layout.total_size)?;
        mapping.set_owner(true);
        if mapping.len() < layout.total_size {
            return Err(IpcError::Allocation {
                name: self.id.name.clone(),
                status: Status::from_errno(libc::ENOMEM),
                reason: format!(
                    "mapped {} bytes but {} were requested",
                    mapping.len(),
                    layout.total_size
                ),
            });
        }

        let base = mapping.as_ptr();
        let lock = unsafe {
            layout.write_header(base);
            SegmentLock::init(base.add(layout.lock_offset), base.add(layout.payload_offset))?
        };
        layout::publish(unsafe { layout::header(base) });
        mapping.set_owner(owner);

        info!("created shared memory segment {} using {}", self.id, self.implementation_name());
        self.state = State::Open(Attached {
            mapping,
            layout,
            lock,
            owner,
            unlinked: false,
            lock_held: Cell::new(false),
        });
        Ok(())
    }

    /// Attaches to a segment created elsewhere. Returns `Ok(false)` when it
    /// does not exist yet so a second process can poll for it.
    pub fn open(&mut self, owner: bool) -> Result<bool> {
        self.ensure_detached()?;
        let mut mapping = match segment::open(self.backend, &self.id)? {
            Some(mapping) => mapping,
            None => {
                trace!("{} does not exist yet", self.id);
                return Ok(false);
            }
        };
        if mapping.len() < HEADER_LEN {
            trace!("{} is not sized yet", self.id);
            return Ok(false);
        }

        let header = unsafe { layout::header(mapping.as_ptr()) };
        let deadline = Instant::now() + OPEN_GRACE;
        while !layout::is_published(header) {
            if Instant::now() >= deadline {
                debug!("timed out waiting for the creator of {} to publish its header", self.id);
                return Ok(false);
            }
            thread::yield_now();
        }
        let layout = Layout::read(header, mapping.len())?;

        let base = mapping.as_ptr();
        let lock = unsafe {
            SegmentLock::attach(base.add(layout.lock_offset), base.add(layout.payload_offset))?
        };
        mapping.set_owner(owner);

        debug!(
            "opened {} with {} payload bytes and {} mailboxes (owner: {})",
            self.id, layout.num_bytes, layout.num_mailboxes, owner
        );
        self.state = State::Open(Attached {
            mapping,
            layout,
            lock,
            owner,
            unlinked: false,
            lock_held: Cell::new(false),
        });
        Ok(true)
    }

    /// Removes the OS visible name. The mapping stays usable until closed but
    /// no other process can open it any more, and this handle will no longer
    /// destroy anything when it closes.
    pub fn unlink(&mut self) -> Result<()> {
        let id = self.id.clone();
        let attached = self.attached_mut()?;
        if attached.unlinked {
            return Ok(());
        }
        if !attached.owner {
            warn!("unlinking {} though this handle is not the owner", id);
        }
        attached.mapping.unlink()?;
        attached.unlinked = true;
        debug!("unlinked {}", id);
        Ok(())
    }

    /// Releases this handle. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Open(attached) => {
                attached.detach(&self.id);
                Ok(())
            }
            State::Detached => Ok(()),
            State::Closed => Err(StateError::AlreadyClosed.into()),
        }
    }

    /// Zeroes the payload and empties every mailbox. The lock is untouched.
    pub fn reset(&mut self) -> Result<()> {
        let attached = self.attached()?;
        for mailbox in 0..attached.layout.num_mailboxes {
            attached.mailbox(mailbox)?.store(EMPTY, Ordering::Release);
        }
        unsafe { ptr::write_bytes(attached.payload(), 0, attached.layout.num_bytes) };
        trace!("reset {}", self.id);
        Ok(())
    }

    pub fn mailbox_count(&self) -> Result<usize> {
        Ok(self.attached()?.layout.num_mailboxes)
    }

    /// Marks `mailbox` as holding a message. The payload must already be
    /// written. Posting a posted mailbox changes nothing.
    pub fn post(&self, mailbox: usize) -> Result<()> {
        let word = self.attached()?.mailbox(mailbox)?;
        if word
            .compare_exchange(EMPTY, POSTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("mailbox {} of {} is already posted", mailbox, self.id);
        }
        Ok(())
    }

    /// Marks the message in `mailbox` as consumed so the writer may reuse it.
    /// Unposting an empty mailbox changes nothing.
    pub fn unpost(&self, mailbox: usize) -> Result<()> {
        let word = self.attached()?.mailbox(mailbox)?;
        if word
            .compare_exchange(POSTED, EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("mailbox {} of {} is already empty", mailbox, self.id);
        }
        Ok(())
    }

    #[inline]
    pub fn is_message_available(&self, mailbox: usize) -> Result<bool> {
        Ok(self.attached()?.mailbox(mailbox)?.load(Ordering::Acquire) == POSTED)
    }

    #[inline]
    pub fn can_write_message(&self, mailbox: usize) -> Result<bool> {
        Ok(!self.is_message_available(mailbox)?)
    }

    /// Polls until `mailbox` holds a message. `None` waits forever; returns
    /// `Ok(false)` when the timeout runs out first.
    pub fn wait_for_message(
        &self,
        mailbox: usize,
        timeout: Option<Duration>,
        strategy: WaitStrategy,
    ) -> Result<bool> {
        wait::wait_until(timeout, strategy, || self.is_message_available(mailbox))
    }

    /// Polls until `mailbox` is empty again.
    pub fn wait_for_empty(
        &self,
        mailbox: usize,
        timeout: Option<Duration>,
        strategy: WaitStrategy,
    ) -> Result<bool> {
        wait::wait_until(timeout, strategy, || self.can_write_message(mailbox))
    }

    /// `timeout_millis` of [`TRY_LOCK`](crate::TRY_LOCK) tries once, a
    /// negative value such as [`INFINITE`](crate::INFINITE) waits forever and
    /// anything else waits up to that many milliseconds.
    pub fn lock(&self, timeout_millis: i64) -> Result<bool> {
        let attached = self.attached()?;
        let acquired = attached.lock.acquire(LockTimeout::from_millis(timeout_millis))?;
        if acquired {
            attached.lock_held.set(true);
        }
        Ok(acquired)
    }

    pub fn try_lock(&self) -> Result<bool> {
        self.lock(TRY_LOCK)
    }

    pub fn unlock(&self) -> Result<()> {
        let attached = self.attached()?;
        if LOCKING_ENABLED && !attached.lock_held.get() {
            return Err(StateError::NotLocked.into());
        }
        attached.lock.release()?;
        attached.lock_held.set(false);
        Ok(())
    }

    /// Scoped [`lock`](Self::lock). `None` when the lock was not obtained.
    pub fn lock_as_resource(&self, timeout_millis: i64) -> Result<Option<LockGuard<'_>>> {
        if self.lock(timeout_millis)? {
            Ok(Some(LockGuard::new(self)))
        } else {
            Ok(None)
        }
    }

    /// Payload size in bytes, fixed at creation.
    pub fn size(&self) -> Result<usize> {
        Ok(self.attached()?.layout.num_bytes)
    }

    pub fn buffer(&self, offset: usize, length: usize) -> Result<&[u8]> {
        let attached = self.attached()?;
        attached.check_range(offset, length)?;
        Ok(unsafe { slice::from_raw_parts(attached.payload().add(offset), length) })
    }

    /// Everything from `offset` to the end of the payload.
    pub fn buffer_from(&self, offset: usize) -> Result<&[u8]> {
        let size = self.size()?;
        self.buffer(offset, size.saturating_sub(offset))
            .map_err(|_| IpcError::Bounds {
                offset,
                length: 0,
                size,
            })
    }

    pub fn buffer_mut(&mut self, offset: usize, length: usize) -> Result<&mut [u8]> {
        let attached = self.attached()?;
        attached.check_range(offset, length)?;
        Ok(unsafe { slice::from_raw_parts_mut(attached.payload().add(offset), length) })
    }

    /// Address of `offset` in this process, for handing to native code.
    pub fn raw_buffer(&self, offset: usize) -> Result<*mut u8> {
        let attached = self.attached()?;
        attached.check_range(offset, 0)?;
        Ok(unsafe { attached.payload().add(offset) })
    }

    /// Locks, lends `f` the whole payload and unlocks again, also when `f`
    /// panics. `Ok(None)` when the lock was not obtained in time.
    pub fn access<R, F>(&mut self, timeout_millis: i64, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let (data, len) = {
            let attached = self.attached()?;
            (attached.payload(), attached.layout.num_bytes)
        };
        let guard = match self.lock_as_resource(timeout_millis)? {
            Some(guard) => guard,
            None => return Ok(None),
        };
        let result = f(unsafe { slice::from_raw_parts_mut(data, len) });
        guard.unlock()?;
        Ok(Some(result))
    }

    pub fn try_access<R, F>(&mut self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.access(TRY_LOCK, f)
    }

    /// Locks and returns a zero-copy image view of `shape` elements of `elem`
    /// starting at `offset`. Closing the view releases the lock. `Ok(None)`
    /// when the lock was not obtained in time.
    pub fn access_as_image(
        &mut self,
        offset: usize,
        shape: &ImageShape,
        elem: ElementType,
        timeout_millis: i64,
    ) -> Result<Option<ImageView<'_>>> {
        let data = {
            let attached = self.attached()?;
            let length = shape.byte_len(elem).ok_or(IpcError::Bounds {
                offset,
                length: usize::MAX,
                size: attached.layout.num_bytes,
            })?;
            attached.check_range(offset, length)?;
            unsafe { attached.payload().add(offset) }
        };
        if !self.lock(timeout_millis)? {
            return Ok(None);
        }
        Ok(Some(ImageView::new(
            self,
            data,
            offset,
            shape.clone(),
            elem,
            CloseAction::ReleaseLock,
        )))
    }

    pub fn try_access_as_image(
        &mut self,
        offset: usize,
        shape: &ImageShape,
        elem: ElementType,
    ) -> Result<Option<ImageView<'_>>> {
        self.access_as_image(offset, shape, elem, TRY_LOCK)
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        if let State::Open(attached) = mem::replace(&mut self.state, State::Closed) {
            attached.detach(&self.id);
        }
    }
}

impl fmt::Debug for ShmChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match &self.state {
            State::Open(a) => Some(a.layout.num_bytes),
            _ => None,
        };
        f.debug_struct("ShmChannel")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("open", &self.is_open())
            .field("owner", &self.is_owner())
            .field("size", &size)
            .finish()
    }
}
