//! Single-slot frame hand-off over a simplex channel.
//!
//! The writer fills the payload through a write view and the view posts the
//! mailbox when it closes; the reader's view unposts it again. Both sides
//! hold the channel lock while their view is open.

use std::time::Duration;

use log::trace;

use super::channel::ShmChannel;
use super::errors::{IpcError, Result};
use super::image::{CloseAction, ElementType, Frame, ImageShape, ImageView};
use super::lock::INFINITE;
use super::wait::WaitStrategy;

const MAILBOX: usize = 0;

pub struct FrameQueue {
    channel: ShmChannel,
    strategy: WaitStrategy,
}

impl FrameQueue {
    pub fn new(name: &str) -> FrameQueue {
        FrameQueue::with_channel(ShmChannel::new(name))
    }

    pub fn with_channel(channel: ShmChannel) -> FrameQueue {
        FrameQueue {
            channel,
            strategy: WaitStrategy::default(),
        }
    }

    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> FrameQueue {
        self.strategy = strategy;
        self
    }

    pub fn channel(&self) -> &ShmChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ShmChannel {
        &mut self.channel
    }

    pub fn into_channel(self) -> ShmChannel {
        self.channel
    }

    pub fn create(&mut self, size: usize, owner: bool) -> Result<()> {
        self.channel.create(size, owner, 1)
    }

    /// Creates a segment sized for frames shaped like `frame`.
    pub fn create_for(&mut self, frame: &Frame, owner: bool) -> Result<()> {
        self.create(frame.len(), owner)
    }

    pub fn open(&mut self, owner: bool) -> Result<bool> {
        self.channel.open(owner)
    }

    pub fn close(&mut self) -> Result<()> {
        self.channel.close()
    }

    pub fn is_message_available(&self) -> Result<bool> {
        self.channel.is_message_available(MAILBOX)
    }

    /// `None` unless a frame is waiting and the lock is free right now.
    pub fn try_read_view(&mut self, shape: &ImageShape, elem: ElementType) -> Result<Option<ImageView<'_>>> {
        if !self.channel.is_message_available(MAILBOX)? {
            return Ok(None);
        }
        let view = self.channel.try_access_as_image(0, shape, elem)?;
        Ok(view.map(|mut view| {
            view.on_close(CloseAction::Unpost(MAILBOX));
            view
        }))
    }

    /// Waits for a frame and returns a view of it.
    pub fn read_view(&mut self, shape: &ImageShape, elem: ElementType) -> Result<ImageView<'_>> {
        self.wait_readable(None)?;
        let mut view = self
            .channel
            .access_as_image(0, shape, elem, INFINITE)?
            .ok_or(IpcError::WouldBlock)?;
        view.on_close(CloseAction::Unpost(MAILBOX));
        Ok(view)
    }

    /// Copies the next frame out of shared memory and frees the slot.
    pub fn copy_read(&mut self, shape: &ImageShape, elem: ElementType) -> Result<Frame> {
        let view = self.read_view(shape, elem)?;
        let frame = view.to_frame();
        view.close()?;
        Ok(frame)
    }

    /// Like [`copy_read`](Self::copy_read) but gives up after `timeout`.
    pub fn copy_read_timeout(
        &mut self,
        shape: &ImageShape,
        elem: ElementType,
        timeout: Duration,
    ) -> Result<Option<Frame>> {
        if !self.wait_readable(Some(timeout))? {
            return Ok(None);
        }
        self.copy_read(shape, elem).map(Some)
    }

    /// `None` unless the slot is free and the lock is free right now.
    pub fn try_write_view(&mut self, shape: &ImageShape, elem: ElementType) -> Result<Option<ImageView<'_>>> {
        if !self.channel.can_write_message(MAILBOX)? {
            return Ok(None);
        }
        let view = self.channel.try_access_as_image(0, shape, elem)?;
        Ok(view.map(|mut view| {
            view.on_close(CloseAction::Post(MAILBOX));
            view
        }))
    }

    /// Waits for the slot to be free and returns a view to fill. The frame is
    /// published when the view closes.
    pub fn write_view(&mut self, shape: &ImageShape, elem: ElementType) -> Result<ImageView<'_>> {
        self.wait_writable(None)?;
        let mut view = self
            .channel
            .access_as_image(0, shape, elem, INFINITE)?
            .ok_or(IpcError::WouldBlock)?;
        view.on_close(CloseAction::Post(MAILBOX));
        Ok(view)
    }

    pub fn copy_write(&mut self, frame: &Frame) -> Result<()> {
        let mut view = self.write_view(frame.shape(), frame.element_type())?;
        view.copy_from(frame.as_bytes())?;
        view.close()
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        trace!("waiting for a frame on {}", self.channel.id());
        self.channel.wait_for_message(MAILBOX, timeout, self.strategy)
    }

    fn wait_writable(&self, timeout: Option<Duration>) -> Result<bool> {
        trace!("waiting for {} to drain", self.channel.id());
        self.channel.wait_for_empty(MAILBOX, timeout, self.strategy)
    }
}
