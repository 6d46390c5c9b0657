use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "locking")]
mod lock_tests;

/// Segment names must not collide between parallel tests or test runs.
pub(crate) fn unique_name(prefix: &str) -> String {
    static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmbox_{}_{}_{}",
        prefix,
        std::process::id(),
        SEGMENT_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
