use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use super::channel::ShmChannel;
use super::errors::{IpcError, Result};
use super::naming::SegmentId;
use super::segment::Backend;
use super::status::{ErrorCode, Status};
use super::wait::WaitStrategy;

/// Everything needed to create or open one channel.
///
/// Usually nested in an application config and loaded with `confy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    /// Explicit System V key. Derived from `name` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<i32>,
    pub backend: Backend,
    /// Payload bytes.
    pub size: usize,
    pub mailboxes: usize,
    pub owner: bool,
    pub wait_strategy: WaitStrategy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name: "shmbox".to_string(),
            key: None,
            backend: Backend::Posix,
            size: 4096,
            mailboxes: 1,
            owner: true,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

impl ChannelConfig {
    pub fn segment_id(&self) -> SegmentId {
        match self.key {
            Some(key) => SegmentId::with_key(&self.name, key),
            None => SegmentId::new(&self.name),
        }
    }

    /// An unopened handle.
    pub fn channel(&self) -> ShmChannel {
        ShmChannel::with_id(self.segment_id(), self.backend)
    }

    pub fn create(&self) -> Result<ShmChannel> {
        let mut channel = self.channel();
        channel.create(self.size, self.owner, self.mailboxes)?;
        Ok(channel)
    }

    /// `Ok(None)` while the segment does not exist.
    pub fn open(&self) -> Result<Option<ShmChannel>> {
        let mut channel = self.channel();
        if channel.open(self.owner)? {
            Ok(Some(channel))
        } else {
            Ok(None)
        }
    }

    /// Reads a standalone TOML file holding just the channel table.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<ChannelConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        ChannelConfig::from_toml_str(&text).map_err(|e| IpcError::Native {
            status: Status::from_code(ErrorCode::InvalidState),
            message: format!("{}: {}", path.display(), e),
        })
    }

    pub fn from_toml_str(text: &str) -> std::result::Result<ChannelConfig, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}
