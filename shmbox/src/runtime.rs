//! Process-wide setup shared by every binding.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, LevelFilter};
use once_cell::sync::Lazy;

use super::lock::LOCKING_ENABLED;
use super::segment::Backend;

/// Native log levels as used by bindings: TRACE=0 up to FATAL=5.
pub const NATIVE_TRACE: i32 = 0;
pub const NATIVE_DEBUG: i32 = 1;
pub const NATIVE_INFO: i32 = 2;
pub const NATIVE_WARN: i32 = 3;
pub const NATIVE_ERROR: i32 = 4;
pub const NATIVE_FATAL: i32 = 5;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub version: &'static str,
    pub locking: bool,
    pub backends: Vec<&'static str>,
}

static INFO: Lazy<RuntimeInfo> = Lazy::new(|| {
    let mut backends = vec![Backend::Posix.implementation_name()];
    if cfg!(unix) {
        backends.push(Backend::SystemV.implementation_name());
    }
    RuntimeInfo {
        version: env!("CARGO_PKG_VERSION"),
        locking: LOCKING_ENABLED,
        backends,
    }
});

pub fn info() -> &'static RuntimeInfo {
    &INFO
}

/// Sets the log ceiling. Only the first call after start or
/// [`shutdown`] returns `true`.
pub fn initialize(level: LevelFilter) -> bool {
    log::set_max_level(level);
    let first = INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    if first {
        let info = info();
        info!(
            "shmbox {} initialized (locking: {}, backends: {})",
            info.version,
            info.locking,
            info.backends.join(", ")
        );
    }
    first
}

/// Channels own their resources, so this only clears the flag. Returns
/// `false` when not initialized.
pub fn shutdown() -> bool {
    let was = INITIALIZED.swap(false, Ordering::AcqRel);
    if was {
        info!("shmbox shut down");
    }
    was
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn level_from_native(level: i32) -> LevelFilter {
    match level {
        i32::MIN..=NATIVE_TRACE => LevelFilter::Trace,
        NATIVE_DEBUG => LevelFilter::Debug,
        NATIVE_INFO => LevelFilter::Info,
        NATIVE_WARN => LevelFilter::Warn,
        NATIVE_ERROR => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}

pub fn level_to_native(level: LevelFilter) -> i32 {
    match level {
        LevelFilter::Trace => NATIVE_TRACE,
        LevelFilter::Debug => NATIVE_DEBUG,
        LevelFilter::Info => NATIVE_INFO,
        LevelFilter::Warn => NATIVE_WARN,
        LevelFilter::Error => NATIVE_ERROR,
        LevelFilter::Off => NATIVE_FATAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_levels() {
        assert_eq!(level_from_native(NATIVE_TRACE), LevelFilter::Trace);
        assert_eq!(level_from_native(-3), LevelFilter::Trace);
        assert_eq!(level_from_native(NATIVE_WARN), LevelFilter::Warn);
        assert_eq!(level_from_native(NATIVE_FATAL), LevelFilter::Off);
        for native in NATIVE_TRACE..=NATIVE_FATAL {
            assert_eq!(level_to_native(level_from_native(native)), native);
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        shutdown();
        assert!(initialize(LevelFilter::Warn));
        assert!(!initialize(LevelFilter::Warn));
        assert!(is_initialized());
        assert!(shutdown());
        assert!(!shutdown());
        assert!(!is_initialized());
        assert_eq!(info().locking, LOCKING_ENABLED);
    }
}
