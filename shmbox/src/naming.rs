use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Derives the System V key for a segment name so that two processes sharing
/// only a string agree on the key: the first four bytes of the MD5 digest,
/// big-endian.
pub fn key_from_name(name: &str) -> i32 {
    let digest = md5::compute(name.as_bytes()).0;
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// POSIX shared memory object names need a single leading slash.
pub fn posix_name(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

/// Name and key of a segment. Which one the OS sees depends on the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId {
    pub name: String,
    pub key: i32,
}

impl SegmentId {
    pub fn new(name: &str) -> SegmentId {
        SegmentId {
            name: name.to_string(),
            key: key_from_name(name),
        }
    }

    pub fn with_key(name: &str, key: i32) -> SegmentId {
        SegmentId {
            name: name.to_string(),
            key,
        }
    }

    pub fn os_name(&self) -> String {
        posix_name(&self.name)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.name, self.key)
    }
}
