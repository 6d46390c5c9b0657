//! Shared memory channels: a fixed size payload plus mailbox flags, with an
//! optional process-shared lock and zero-copy image views over the payload.

mod errors;
mod layout;

pub mod channel;
pub mod config;
pub mod frame_queue;
pub mod image;
pub mod lock;
pub mod naming;
pub mod runtime;
pub mod segment;
pub mod status;
pub mod wait;

#[cfg(test)]
mod tests;

pub use channel::{LockGuard, ShmChannel};
pub use config::ChannelConfig;
pub use errors::{IpcError, Result, StateError};
pub use frame_queue::FrameQueue;
pub use image::{CloseAction, Depth, ElementType, Frame, ImageShape, ImageView};
pub use lock::{INFINITE, TRY_LOCK};
pub use naming::SegmentId;
pub use segment::Backend;
pub use status::{ErrorCode, Status};
pub use wait::WaitStrategy;

/// Mailbox count of a simplex channel.
pub const SIMPLEX: usize = 1;
/// Mailboxes of a duplex channel: requests in 0, responses in 1.
pub const DUPLEX: usize = 2;
