use std::fmt;
use std::slice;

use log::warn;

use super::{read_scalar, write_scalar, ElementType, Frame, ImageShape};
use crate::channel::ShmChannel;
use crate::errors::{IpcError, Result};

/// Side effect run once when a view is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseAction {
    ReleaseLock,
    Post(usize),
    Unpost(usize),
}

/// Zero-copy window over part of a channel's payload.
///
/// Writes land directly in shared memory. Close actions run in reverse order
/// of registration, once, either from [`close`](ImageView::close) or when
/// the view is dropped.
pub struct ImageView<'a> {
    channel: &'a ShmChannel,
    data: *mut u8,
    offset: usize,
    shape: ImageShape,
    elem: ElementType,
    on_close: Vec<CloseAction>,
    closed: bool,
}

impl<'a> ImageView<'a> {
    pub(crate) fn new(
        channel: &'a ShmChannel,
        data: *mut u8,
        offset: usize,
        shape: ImageShape,
        elem: ElementType,
        first: CloseAction,
    ) -> ImageView<'a> {
        ImageView {
            channel,
            data,
            offset,
            shape,
            elem,
            on_close: vec![first],
            closed: false,
        }
    }

    pub(crate) fn on_close(&mut self, action: CloseAction) {
        self.on_close.push(action);
    }

    pub fn shape(&self) -> &ImageShape {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.elem
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    /// Offset of the first byte within the payload.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        // Checked against the segment when the view was made.
        self.shape.byte_len(self.elem).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_actions(&self) -> &[CloseAction] {
        &self.on_close
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data, self.len()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data, self.len()) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    pub fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.len() {
            return Err(IpcError::Bounds {
                offset: self.offset,
                length: src.len(),
                size: self.len(),
            });
        }
        self.as_bytes_mut().copy_from_slice(src);
        Ok(())
    }

    /// Copies the viewed bytes out of shared memory.
    pub fn to_frame(&self) -> Frame {
        Frame {
            shape: self.shape.clone(),
            elem: self.elem,
            data: self.as_bytes().to_vec(),
        }
    }

    pub fn get_f64(&self, row: usize, col: usize, channel: usize) -> Result<f64> {
        read_scalar(self.as_bytes(), &self.shape, self.elem, row, col, channel)
    }

    pub fn put_f64(&mut self, row: usize, col: usize, channel: usize, value: f64) -> Result<()> {
        let (shape, elem) = (self.shape.clone(), self.elem);
        write_scalar(self.as_bytes_mut(), &shape, elem, row, col, channel, value)
    }

    pub fn post(&self, mailbox: usize) -> Result<()> {
        self.channel.post(mailbox)
    }

    pub fn unpost(&self, mailbox: usize) -> Result<()> {
        self.channel.unpost(mailbox)
    }

    /// Runs the close actions and reports the first failure. Every action
    /// runs even when an earlier one fails.
    pub fn close(mut self) -> Result<()> {
        self.run_close_actions()
    }

    fn run_close_actions(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        for action in self.on_close.iter().rev() {
            let outcome = match *action {
                CloseAction::ReleaseLock => self.channel.unlock(),
                CloseAction::Post(mailbox) => self.channel.post(mailbox),
                CloseAction::Unpost(mailbox) => self.channel.unpost(mailbox),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ImageView<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.run_close_actions() {
            warn!("failed to close image view on {}: {}", self.channel.id(), e);
        }
    }
}

impl fmt::Debug for ImageView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageView")
            .field("channel", &self.channel.name())
            .field("offset", &self.offset)
            .field("shape", &self.shape)
            .field("elem", &self.elem)
            .field("on_close", &self.on_close)
            .finish()
    }
}
